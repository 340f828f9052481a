//! Storage backend adapters.
//!
//! The controller drives a storage system exclusively through the
//! [`BackendAdapter`] trait.  Two implementations ship with the crate:
//!
//! * [`localdir::LocalDirBackend`] keeps each volume as a directory on the
//!   local filesystem and survives restarts.
//! * [`memory::InMemoryBackend`] keeps everything in memory and records every
//!   call, which makes it the fake adapter of choice in tests.

pub mod localdir;
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::capability::CapabilitySupport;
use crate::types::{CapacityRange, NodeId, Secrets, Volume, VolumeCapability, VolumeId};

/// Failures reported by a backend.  Converted into [`crate::CsiError`] by
/// the controller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend has no such volume (or attachment).
    #[error("{0} not found in backend")]
    NotFound(String),

    /// Not enough capacity left to satisfy the request.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// The backend rejected the request shape.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other backend failure.
    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    /// Create a [`BackendError::Failed`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn failed<E: std::fmt::Display>(e: E) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Result of a successful provisioning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedVolume {
    /// Backend-assigned, stable identifier.
    pub volume_id: VolumeId,
    /// Capacity actually allocated.
    pub capacity_bytes: u64,
    /// Context to hand to later publish / node calls.
    pub volume_context: HashMap<String, String>,
}

/// Optional controller RPCs a backend supports.  Fixed per backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendFeatures {
    /// Backend implements `attach` / `detach`.
    pub publish_unpublish: bool,
    /// Backend can report free capacity.
    pub get_capacity: bool,
}

/// Uniform contract over a concrete storage system.
///
/// Credential maps are passed through untouched; implementations must not
/// log or persist them.
#[async_trait]
pub trait BackendAdapter: Send + Sync + 'static {
    /// Capability combinations this backend can serve.  Read once at
    /// controller construction.
    fn supported_capabilities(&self) -> Vec<CapabilitySupport>;

    /// Optional RPCs this backend implements.
    fn features(&self) -> BackendFeatures;

    /// Allocate a new volume.  `capacity` of `None` selects the backend
    /// default size.
    async fn provision(
        &self,
        name: &str,
        capacity: Option<CapacityRange>,
        capabilities: &[VolumeCapability],
        parameters: &HashMap<String, String>,
        secrets: &Secrets,
    ) -> Result<ProvisionedVolume, BackendError>;

    /// Release a volume and its data.
    async fn deprovision(&self, volume_id: &VolumeId, secrets: &Secrets)
    -> Result<(), BackendError>;

    /// Grant `node_id` access to the volume and return the publish context.
    async fn attach(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        capability: &VolumeCapability,
        read_only: bool,
        volume_context: &HashMap<String, String>,
        secrets: &Secrets,
    ) -> Result<HashMap<String, String>, BackendError>;

    /// Revoke `node_id`'s access to the volume.
    async fn detach(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        secrets: &Secrets,
    ) -> Result<(), BackendError>;

    /// Look up a single volume.
    async fn describe(&self, volume_id: &VolumeId) -> Result<Volume, BackendError>;

    /// Free capacity usable with `capabilities` (all of them when empty).
    async fn capacity(&self, capabilities: &[VolumeCapability]) -> Result<u64, BackendError>;

    /// Every volume the backend knows about.
    async fn list(&self) -> Result<Vec<Volume>, BackendError>;

    /// Liveness of the backend connection.
    async fn probe(&self) -> Result<bool, BackendError> {
        Ok(true)
    }
}
