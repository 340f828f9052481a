//! In-memory backend.
//!
//! [`InMemoryBackend`] models a capacity pool entirely in memory.  It counts
//! every call, can add artificial latency and can be told to fail specific
//! operations, which makes it the standard fake adapter for controller tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{BackendAdapter, BackendError, BackendFeatures, ProvisionedVolume};
use crate::capability::CapabilitySupport;
use crate::types::*;

const DEFAULT_VOLUME_BYTES: u64 = 1024 * 1024 * 1024;

/// Operation a fault can be injected into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Provision,
    Deprovision,
    Attach(NodeId),
    Detach(NodeId),
}

/// Number of calls the backend has received, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub provision: usize,
    pub deprovision: usize,
    pub attach: usize,
    pub detach: usize,
}

#[derive(Debug, Default)]
struct Counters {
    provision: AtomicUsize,
    deprovision: AtomicUsize,
    attach: AtomicUsize,
    detach: AtomicUsize,
}

#[derive(Debug, Clone)]
struct MemVolume {
    volume: Volume,
    nodes: BTreeSet<NodeId>,
}

/// Backend keeping every volume in memory.
#[derive(Debug)]
pub struct InMemoryBackend {
    volumes: DashMap<VolumeId, MemVolume>,
    total_bytes: u64,
    used_bytes: AtomicU64,
    default_volume_bytes: u64,
    supported: Vec<CapabilitySupport>,
    features: BackendFeatures,
    latency: Duration,
    faults: DashMap<FaultPoint, BackendError>,
    reissue: Mutex<Option<VolumeId>>,
    calls: Counters,
}

impl InMemoryBackend {
    /// A pool of `total_bytes` supporting every mode with both access types.
    pub fn new(total_bytes: u64) -> Self {
        let modes = [
            AccessMode::SingleNodeWriter,
            AccessMode::SingleNodeReaderOnly,
            AccessMode::MultiNodeReaderOnly,
            AccessMode::MultiNodeSingleWriter,
            AccessMode::MultiNodeMultiWriter,
        ];
        let supported = modes
            .iter()
            .flat_map(|&mode| {
                [
                    CapabilitySupport::new(mode, AccessTypeKind::Mount),
                    CapabilitySupport::new(mode, AccessTypeKind::Block),
                ]
            })
            .collect();

        Self {
            volumes: DashMap::new(),
            total_bytes,
            used_bytes: AtomicU64::new(0),
            default_volume_bytes: DEFAULT_VOLUME_BYTES.min(total_bytes),
            supported,
            features: BackendFeatures {
                publish_unpublish: true,
                get_capacity: true,
            },
            latency: Duration::ZERO,
            faults: DashMap::new(),
            reissue: Mutex::new(None),
            calls: Counters::default(),
        }
    }

    /// Restrict the declared capability combinations.
    pub fn with_supported(mut self, supported: Vec<CapabilitySupport>) -> Self {
        self.supported = supported;
        self
    }

    pub fn with_features(mut self, features: BackendFeatures) -> Self {
        self.features = features;
        self
    }

    /// Delay every mutating call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Size used when a request carries no capacity range.
    pub fn with_default_volume_bytes(mut self, bytes: u64) -> Self {
        self.default_volume_bytes = bytes;
        self
    }

    /// Make every call at `point` fail with `err` until cleared.
    pub fn inject_fault(&self, point: FaultPoint, err: BackendError) {
        self.faults.insert(point, err);
    }

    pub fn clear_fault(&self, point: &FaultPoint) {
        self.faults.remove(point);
    }

    /// Hand out `volume_id` on the next provision instead of a fresh one.
    pub fn reissue_id(&self, volume_id: VolumeId) {
        *self.reissue.lock().unwrap_or_else(|e| e.into_inner()) = Some(volume_id);
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            provision: self.calls.provision.load(Ordering::SeqCst),
            deprovision: self.calls.deprovision.load(Ordering::SeqCst),
            attach: self.calls.attach.load(Ordering::SeqCst),
            detach: self.calls.detach.load(Ordering::SeqCst),
        }
    }

    /// Nodes the backend believes the volume is attached to.
    pub fn attached_nodes(&self, volume_id: &VolumeId) -> Vec<NodeId> {
        self.volumes
            .get(volume_id)
            .map(|v| v.nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a volume behind the controller's back.
    pub fn forget(&self, volume_id: &VolumeId) {
        if let Some((_, v)) = self.volumes.remove(volume_id) {
            self.used_bytes
                .fetch_sub(v.volume.capacity_bytes, Ordering::SeqCst);
        }
    }

    async fn enter(&self, point: FaultPoint) -> Result<(), BackendError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.faults.get(&point) {
            Some(err) => Err(err.value().clone()),
            None => Ok(()),
        }
    }

    fn resolve_size(&self, capacity: Option<CapacityRange>) -> Result<u64, BackendError> {
        let Some(range) = capacity else {
            return Ok(self.default_volume_bytes);
        };
        let size = match (range.required_bytes, range.limit_bytes) {
            (0, 0) => self.default_volume_bytes,
            (0, limit) => self.default_volume_bytes.min(limit),
            (required, _) => required,
        };
        if range.contains(size) {
            Ok(size)
        } else {
            Err(BackendError::InvalidArgument(format!(
                "cannot satisfy capacity range {}..{}",
                range.required_bytes, range.limit_bytes
            )))
        }
    }

    fn reserve(&self, bytes: u64) -> Result<(), BackendError> {
        self.used_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|&n| n <= self.total_bytes)
            })
            .map(|_| ())
            .map_err(|used| {
                BackendError::CapacityExhausted(format!(
                    "requested {bytes} bytes, {} of {} free",
                    self.total_bytes - used,
                    self.total_bytes
                ))
            })
    }
}

#[async_trait]
impl BackendAdapter for InMemoryBackend {
    fn supported_capabilities(&self) -> Vec<CapabilitySupport> {
        self.supported.clone()
    }

    fn features(&self) -> BackendFeatures {
        self.features
    }

    async fn provision(
        &self,
        name: &str,
        capacity: Option<CapacityRange>,
        _capabilities: &[VolumeCapability],
        parameters: &HashMap<String, String>,
        _secrets: &Secrets,
    ) -> Result<ProvisionedVolume, BackendError> {
        self.calls.provision.fetch_add(1, Ordering::SeqCst);
        self.enter(FaultPoint::Provision).await?;

        let size = self.resolve_size(capacity)?;
        self.reserve(size)?;

        let reissued = self.reissue.lock().unwrap_or_else(|e| e.into_inner()).take();
        let volume_id =
            reissued.unwrap_or_else(|| VolumeId(format!("mem-{}", uuid::Uuid::new_v4())));
        let volume_context = HashMap::from([("backend".to_owned(), "memory".to_owned())]);
        self.volumes.insert(
            volume_id.clone(),
            MemVolume {
                volume: Volume {
                    volume_id: volume_id.clone(),
                    capacity_bytes: size,
                    parameters: parameters.clone(),
                    volume_context: volume_context.clone(),
                },
                nodes: BTreeSet::new(),
            },
        );

        debug!(%name, %volume_id, size, "provisioned in memory");
        Ok(ProvisionedVolume {
            volume_id,
            capacity_bytes: size,
            volume_context,
        })
    }

    async fn deprovision(
        &self,
        volume_id: &VolumeId,
        _secrets: &Secrets,
    ) -> Result<(), BackendError> {
        self.calls.deprovision.fetch_add(1, Ordering::SeqCst);
        self.enter(FaultPoint::Deprovision).await?;

        let (_, vol) = self
            .volumes
            .remove(volume_id)
            .ok_or_else(|| BackendError::NotFound(volume_id.to_string()))?;
        self.used_bytes
            .fetch_sub(vol.volume.capacity_bytes, Ordering::SeqCst);
        Ok(())
    }

    async fn attach(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        _capability: &VolumeCapability,
        read_only: bool,
        _volume_context: &HashMap<String, String>,
        _secrets: &Secrets,
    ) -> Result<HashMap<String, String>, BackendError> {
        self.calls.attach.fetch_add(1, Ordering::SeqCst);
        self.enter(FaultPoint::Attach(node_id.clone())).await?;

        let mut vol = self
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| BackendError::NotFound(volume_id.to_string()))?;
        vol.nodes.insert(node_id.clone());

        Ok(HashMap::from([
            ("devicePath".to_owned(), format!("/dev/mem/{volume_id}")),
            ("readOnly".to_owned(), read_only.to_string()),
        ]))
    }

    async fn detach(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        _secrets: &Secrets,
    ) -> Result<(), BackendError> {
        self.calls.detach.fetch_add(1, Ordering::SeqCst);
        self.enter(FaultPoint::Detach(node_id.clone())).await?;

        let mut vol = self
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| BackendError::NotFound(volume_id.to_string()))?;
        vol.nodes.remove(node_id);
        Ok(())
    }

    async fn describe(&self, volume_id: &VolumeId) -> Result<Volume, BackendError> {
        self.volumes
            .get(volume_id)
            .map(|v| v.volume.clone())
            .ok_or_else(|| BackendError::NotFound(volume_id.to_string()))
    }

    async fn capacity(&self, _capabilities: &[VolumeCapability]) -> Result<u64, BackendError> {
        Ok(self.total_bytes - self.used_bytes.load(Ordering::SeqCst))
    }

    async fn list(&self) -> Result<Vec<Volume>, BackendError> {
        Ok(self.volumes.iter().map(|v| v.volume.clone()).collect())
    }
}
