//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle: creation,
//! deletion, publishing to nodes, capability validation, listing, and
//! capacity queries.  It is typically invoked by the RKS control plane, which
//! may deliver any request more than once; every mutating operation must
//! therefore be safe to replay.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::serializer::CallContext;
use crate::types::{
    ControllerCapability, ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest,
    CreateVolumeRequest, DeleteVolumeRequest, GetCapacityRequest, ListVolumesRequest,
    ListVolumesResponse, ValidateVolumeCapabilitiesRequest, ValidationResult, Volume,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or return the existing one for a replayed name.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and
    /// `volume_context` that must be forwarded to subsequent operations.
    async fn create_volume(
        &self,
        ctx: &CallContext,
        req: CreateVolumeRequest,
    ) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  Unknown ids succeed.
    async fn delete_volume(&self, ctx: &CallContext, req: DeleteVolumeRequest)
    -> Result<(), CsiError>;

    /// Make a volume available on a node and return the publish context.
    async fn controller_publish_volume(
        &self,
        ctx: &CallContext,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError>;

    /// Withdraw a volume from one node, or from all nodes.
    async fn controller_unpublish_volume(
        &self,
        ctx: &CallContext,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidationResult, CsiError>;

    /// Return one page of volumes, ordered by id.
    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, CsiError>;

    /// Return the available capacity in bytes.  Best effort, not a
    /// reservation.
    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<u64, CsiError>;

    /// RPCs this controller offers.
    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
