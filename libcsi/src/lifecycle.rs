//! Volume lifecycle controller.
//!
//! [`VolumeController`] implements [`CsiController`] and [`CsiIdentity`] on
//! top of any [`BackendAdapter`].  Every mutating request follows the same
//! path:
//!
//! 1. validate the request shape and negotiate capabilities,
//! 2. take the per-key lock from the [`OperationSerializer`],
//! 3. consult the [`VolumeRegistry`] for a replay of an earlier request,
//! 4. drive the backend and record the outcome in the registry,
//! 5. release the lock.
//!
//! Steps 3-5 run in a spawned task that owns the lock.  A caller that goes
//! away mid-flight gets [`CsiError::Cancelled`], but the backend call still
//! completes and its outcome is recorded, so a retry observes it.
//!
//! # Unpublish failures
//!
//! Detaching from several nodes follows [`UnpublishPolicy`]: `BestEffort`
//! attempts every node and reports the first failure, `StopOnFirstError`
//! stops at it.  Either way, a node whose detach failed keeps its attachment
//! record and every node that detached loses it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendAdapter, BackendError};
use crate::capability::{CapabilityNegotiator, covered_by};
use crate::config::{ControllerConfig, UnpublishPolicy};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::registry::{VolumeRecord, VolumeRegistry};
use crate::serializer::{CallContext, OperationGuard, OperationSerializer, name_key, volume_key};
use crate::types::*;

/// Result of [`VolumeController::reconcile`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Unattached volumes the backend no longer has; dropped from the registry.
    pub forgotten: Vec<VolumeId>,
    /// Volumes the backend lost while still attached; kept until unpublished.
    pub missing_attached: Vec<VolumeId>,
    /// Backend volumes the registry does not know about.
    pub unmanaged: Vec<VolumeId>,
    /// Volumes skipped because an operation held their lock.
    pub busy: Vec<VolumeId>,
}

/// CSI controller over a storage backend.  Cheap to clone.
pub struct VolumeController<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for VolumeController<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<B> {
    backend: Arc<B>,
    registry: Arc<VolumeRegistry>,
    serializer: OperationSerializer,
    negotiator: CapabilityNegotiator,
    config: ControllerConfig,
}

impl<B: BackendAdapter> VolumeController<B> {
    /// Build a controller around an explicitly owned registry.
    ///
    /// The backend's capability declaration is read once, here.
    pub fn new(backend: Arc<B>, registry: Arc<VolumeRegistry>, config: ControllerConfig) -> Self {
        let negotiator = CapabilityNegotiator::new(backend.supported_capabilities());
        let serializer = OperationSerializer::new(config.lock_wait());
        Self {
            inner: Arc::new(Inner {
                backend,
                registry,
                serializer,
                negotiator,
                config,
            }),
        }
    }

    /// Build a controller whose registry follows `config.state_dir`.
    pub async fn from_config(backend: Arc<B>, config: ControllerConfig) -> Result<Self, CsiError> {
        let registry = match &config.state_dir {
            Some(dir) => VolumeRegistry::open(dir.clone()).await?,
            None => VolumeRegistry::in_memory(),
        };
        Ok(Self::new(backend, Arc::new(registry), config))
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn registry(&self) -> &VolumeRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Compare the registry with the backend.
    ///
    /// Unattached volumes the backend lost are dropped from the registry.
    /// Everything else is only reported.
    pub async fn reconcile(&self, ctx: &CallContext) -> Result<ReconcileReport, CsiError> {
        let inner = &self.inner;
        let mut report = ReconcileReport::default();

        for record in inner.registry.snapshot() {
            let id = record.id().clone();
            let _guard = match inner.serializer.acquire(volume_key(&id), ctx).await {
                Ok(guard) => guard,
                Err(CsiError::OperationPending(_)) => {
                    report.busy.push(id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match inner.backend.describe(&id).await {
                Ok(_) => {}
                Err(BackendError::NotFound(_)) => {
                    let attached = inner
                        .registry
                        .get(&id)
                        .is_some_and(|r| !r.attachments.is_empty());
                    if attached {
                        warn!(volume_id = %id, "backend lost a published volume");
                        report.missing_attached.push(id);
                    } else {
                        warn!(volume_id = %id, "backend lost volume, forgetting it");
                        inner.registry.remove_if_present(&id).await?;
                        report.forgotten.push(id);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let known: HashSet<VolumeId> = inner
            .registry
            .snapshot()
            .into_iter()
            .map(|r| r.volume.volume_id)
            .collect();
        let mut unmanaged: Vec<VolumeId> = inner
            .backend
            .list()
            .await?
            .into_iter()
            .map(|v| v.volume_id)
            .filter(|id| !known.contains(id))
            .collect();
        unmanaged.sort();
        report.unmanaged = unmanaged;

        info!(
            forgotten = report.forgotten.len(),
            missing_attached = report.missing_attached.len(),
            unmanaged = report.unmanaged.len(),
            busy = report.busy.len(),
            "registry reconciled against backend",
        );
        Ok(report)
    }

    /// Run `op` in its own task while `guards` are held.
    async fn run_locked<T, Fut>(
        &self,
        ctx: &CallContext,
        guards: Vec<OperationGuard>,
        op: Fut,
    ) -> Result<T, CsiError>
    where
        Fut: Future<Output = Result<T, CsiError>> + Send + 'static,
        T: Send + 'static,
    {
        let mut task = tokio::spawn(async move {
            let _guards = guards;
            op.await
        });

        tokio::select! {
            biased;
            joined = &mut task => joined
                .map_err(|e| CsiError::Internal(format!("controller task failed: {e}")))?,
            _ = ctx.cancelled() => {
                debug!("caller cancelled, operation continues in the background");
                Err(CsiError::Cancelled(
                    "caller went away; the operation completes in the background".into(),
                ))
            }
        }
    }

    fn require(&self, enabled: bool, what: &str) -> Result<(), CsiError> {
        if enabled {
            Ok(())
        } else {
            Err(CsiError::Unimplemented(format!(
                "{what} is not supported by this backend"
            )))
        }
    }
}

impl<B: BackendAdapter> Inner<B> {
    /// Read a record while holding its lock.
    ///
    /// A transient state seen here belongs to an operation that died without
    /// cleaning up, since its owner would still hold the lock otherwise.
    async fn locked_record(&self, id: &VolumeId) -> Result<Option<VolumeRecord>, CsiError> {
        let Some(record) = self.registry.get(id) else {
            return Ok(None);
        };
        if record.state.is_transient() {
            warn!(volume_id = %id, state = ?record.state, "settling stale transient state");
            return self.registry.settle(id).await.map(Some);
        }
        Ok(Some(record))
    }

    /// Settle after a failed backend call, keeping the original error.
    async fn restore(&self, id: &VolumeId) {
        if let Err(e) = self.registry.settle(id).await {
            warn!(volume_id = %id, error = %e, "failed to settle volume state");
        }
    }

    async fn create_locked(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if let Some(id) = self.registry.lookup_name(&req.name) {
            let record = self.locked_record(&id).await?.ok_or_else(|| {
                CsiError::Internal(format!("name {} maps to unregistered volume {id}", req.name))
            })?;
            check_replay(&record, &req)?;
            debug!(name = %req.name, volume_id = %id, "returning existing volume for idempotent create");
            return Ok(record.volume);
        }

        let provisioned = self
            .backend
            .provision(
                &req.name,
                req.capacity_range,
                &req.volume_capabilities,
                &req.parameters,
                &req.secrets,
            )
            .await
            .map_err(|e| {
                warn!(name = %req.name, error = %e, "provision failed");
                CsiError::from(e)
            })?;

        let volume = Volume {
            volume_id: provisioned.volume_id,
            capacity_bytes: provisioned.capacity_bytes,
            parameters: req.parameters,
            volume_context: provisioned.volume_context,
        };
        let record = VolumeRecord::new(req.name, volume.clone(), req.volume_capabilities);
        if let Err(e) = self.registry.insert_if_absent(record).await {
            let id = &volume.volume_id;
            // A registered id belongs to a live volume (or to a record whose
            // persist failed); deprovisioning it would destroy tracked data.
            if self.registry.contains(id) {
                warn!(volume_id = %id, error = %e, "registration failed; backend volume left in place");
            } else {
                warn!(volume_id = %id, error = %e, "registration failed; rolling back provision");
                if let Err(rollback) = self.backend.deprovision(id, &req.secrets).await {
                    warn!(
                        volume_id = %id,
                        error = %rollback,
                        "rollback failed; reconcile will report the volume as unmanaged"
                    );
                }
            }
            return Err(e);
        }

        info!(volume_id = %volume.volume_id, capacity_bytes = volume.capacity_bytes, "volume created");
        Ok(volume)
    }

    async fn delete_locked(&self, req: DeleteVolumeRequest) -> Result<(), CsiError> {
        let id = req.volume_id;
        let Some(record) = self.locked_record(&id).await? else {
            debug!(volume_id = %id, "volume already gone");
            return Ok(());
        };
        if !record.attachments.is_empty() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {id} is still published to {}",
                join_nodes(&record.published_node_ids())
            )));
        }

        self.registry
            .set_state(&id, VolumeState::Deprovisioning)
            .await?;
        match self.backend.deprovision(&id, &req.secrets).await {
            Ok(()) => {}
            Err(BackendError::NotFound(_)) => {
                debug!(volume_id = %id, "backend already released the volume");
            }
            Err(e) => {
                warn!(volume_id = %id, error = %e, "deprovision failed");
                self.restore(&id).await;
                return Err(e.into());
            }
        }

        self.registry.remove_if_present(&id).await?;
        info!(volume_id = %id, "volume deleted");
        Ok(())
    }

    async fn publish_locked(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        let ControllerPublishVolumeRequest {
            volume_id,
            node_id,
            volume_capability,
            read_only,
            secrets,
            volume_context,
        } = req;

        let record = self
            .locked_record(&volume_id)
            .await?
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;

        let verdict = self
            .negotiator
            .negotiate_for_volume(std::slice::from_ref(&volume_capability), &record.capabilities);
        if !verdict.supported {
            return Err(CsiError::InvalidArgument(verdict.reason));
        }

        if let Some(existing) = record.attachment(&node_id) {
            if existing.matches(&volume_capability, read_only) {
                debug!(%volume_id, %node_id, "already published with identical parameters");
                return Ok(existing.publish_context.clone());
            }
            return Err(CsiError::ConflictingAttachment {
                volume_id: volume_id.to_string(),
                node_id: node_id.to_string(),
            });
        }

        if let Some(other) = record.attachments.first() {
            let exclusive = [other.capability.access_mode, volume_capability.access_mode]
                .into_iter()
                .find(|mode| mode.is_single_node());
            if let Some(mode) = exclusive {
                return Err(CsiError::FailedPrecondition(format!(
                    "volume {volume_id} is published to node {} and {mode} allows a single node",
                    other.node_id
                )));
            }
        }

        let volume_context = if volume_context.is_empty() {
            record.volume.volume_context.clone()
        } else {
            volume_context
        };

        self.registry
            .set_state(&volume_id, VolumeState::Publishing)
            .await?;
        let publish_context = match self
            .backend
            .attach(
                &volume_id,
                &node_id,
                &volume_capability,
                read_only,
                &volume_context,
                &secrets,
            )
            .await
        {
            Ok(publish_context) => publish_context,
            Err(e) => {
                warn!(%volume_id, %node_id, error = %e, "attach failed");
                self.restore(&volume_id).await;
                return Err(e.into());
            }
        };

        let attachment = Attachment {
            node_id: node_id.clone(),
            capability: volume_capability,
            read_only,
            publish_context: publish_context.clone(),
        };
        self.registry
            .update(&volume_id, |r| {
                r.attach(attachment);
                r.state = VolumeState::Published;
            })
            .await?;

        info!(%volume_id, %node_id, read_only, "volume published");
        Ok(publish_context)
    }

    async fn unpublish_locked(&self, req: ControllerUnpublishVolumeRequest) -> Result<(), CsiError> {
        let ControllerUnpublishVolumeRequest {
            volume_id,
            node_id,
            secrets,
        } = req;

        let Some(record) = self.locked_record(&volume_id).await? else {
            debug!(%volume_id, "volume unknown, nothing to unpublish");
            return Ok(());
        };

        let targets = match node_id.filter(|n| !n.0.is_empty()) {
            Some(node) if record.attachment(&node).is_some() => vec![node],
            Some(node) => {
                debug!(%volume_id, node_id = %node, "not published to node, nothing to do");
                return Ok(());
            }
            None => record.published_node_ids(),
        };
        if targets.is_empty() {
            return Ok(());
        }

        self.registry
            .set_state(&volume_id, VolumeState::Unpublishing)
            .await?;

        let mut first_err: Option<CsiError> = None;
        for node in &targets {
            match self.backend.detach(&volume_id, node, &secrets).await {
                Ok(()) => {}
                Err(BackendError::NotFound(_)) => {
                    debug!(%volume_id, node_id = %node, "backend has no attachment, treating as detached");
                }
                Err(e) => {
                    warn!(%volume_id, node_id = %node, error = %e, "detach failed");
                    first_err.get_or_insert(e.into());
                    if self.config.unpublish_policy == UnpublishPolicy::StopOnFirstError {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self
                .registry
                .update(&volume_id, |r| {
                    r.detach(node);
                })
                .await
            {
                self.restore(&volume_id).await;
                return Err(e);
            }
            info!(%volume_id, node_id = %node, "volume unpublished");
        }

        self.restore(&volume_id).await;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn validate_create(req: &CreateVolumeRequest) -> Result<(), CsiError> {
    if req.name.is_empty() {
        return Err(CsiError::InvalidArgument("volume name is required".into()));
    }
    if req.volume_capabilities.is_empty() {
        return Err(CsiError::InvalidArgument(
            "at least one volume capability is required".into(),
        ));
    }
    if let Some(range) = req.capacity_range
        && range.is_inverted()
    {
        return Err(CsiError::InvalidArgument(format!(
            "required_bytes {} exceeds limit_bytes {}",
            range.required_bytes, range.limit_bytes
        )));
    }
    Ok(())
}

/// Decide whether `req` replays the creation of `record`.
fn check_replay(record: &VolumeRecord, req: &CreateVolumeRequest) -> Result<(), CsiError> {
    let conflict = |reason: String| CsiError::VolumeAlreadyExists {
        name: req.name.clone(),
        reason,
    };

    if let Some(range) = req.capacity_range
        && !range.contains(record.volume.capacity_bytes)
    {
        return Err(conflict(format!(
            "existing capacity of {} bytes is outside the requested range",
            record.volume.capacity_bytes
        )));
    }
    if let Some(cap) = req
        .volume_capabilities
        .iter()
        .find(|cap| !covered_by(cap, &record.capabilities))
    {
        return Err(conflict(format!(
            "existing volume was not created with capability {cap}"
        )));
    }
    if req.parameters != record.volume.parameters {
        return Err(conflict("parameters differ from the existing volume".into()));
    }
    Ok(())
}

fn require_volume_id(volume_id: &VolumeId) -> Result<(), CsiError> {
    if volume_id.0.is_empty() {
        return Err(CsiError::InvalidArgument("volume id is required".into()));
    }
    Ok(())
}

fn join_nodes(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(|n| n.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl<B: BackendAdapter> CsiController for VolumeController<B> {
    #[instrument(skip(self, ctx, req), fields(name = %req.name))]
    async fn create_volume(
        &self,
        ctx: &CallContext,
        req: CreateVolumeRequest,
    ) -> Result<Volume, CsiError> {
        validate_create(&req)?;
        let verdict = self.inner.negotiator.negotiate(&req.volume_capabilities);
        if !verdict.supported {
            return Err(CsiError::InvalidArgument(verdict.reason));
        }

        // Lock order is always name before volume id.
        let mut guards = vec![self.inner.serializer.acquire(name_key(&req.name), ctx).await?];
        if let Some(id) = self.inner.registry.lookup_name(&req.name) {
            guards.push(self.inner.serializer.acquire(volume_key(&id), ctx).await?);
        }

        let inner = Arc::clone(&self.inner);
        self.run_locked(ctx, guards, async move { inner.create_locked(req).await })
            .await
    }

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.volume_id))]
    async fn delete_volume(
        &self,
        ctx: &CallContext,
        req: DeleteVolumeRequest,
    ) -> Result<(), CsiError> {
        require_volume_id(&req.volume_id)?;
        if !self.inner.registry.contains(&req.volume_id) {
            debug!("volume unknown, nothing to delete");
            return Ok(());
        }

        let guard = self
            .inner
            .serializer
            .acquire(volume_key(&req.volume_id), ctx)
            .await?;
        let inner = Arc::clone(&self.inner);
        self.run_locked(ctx, vec![guard], async move { inner.delete_locked(req).await })
            .await
    }

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_publish_volume(
        &self,
        ctx: &CallContext,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        self.require(
            self.inner.backend.features().publish_unpublish,
            "ControllerPublishVolume",
        )?;
        require_volume_id(&req.volume_id)?;
        if req.node_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }

        let guard = self
            .inner
            .serializer
            .acquire(volume_key(&req.volume_id), ctx)
            .await?;
        let inner = Arc::clone(&self.inner);
        self.run_locked(ctx, vec![guard], async move { inner.publish_locked(req).await })
            .await
    }

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.volume_id))]
    async fn controller_unpublish_volume(
        &self,
        ctx: &CallContext,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        self.require(
            self.inner.backend.features().publish_unpublish,
            "ControllerUnpublishVolume",
        )?;
        require_volume_id(&req.volume_id)?;
        if !self.inner.registry.contains(&req.volume_id) {
            debug!("volume unknown, nothing to unpublish");
            return Ok(());
        }

        let guard = self
            .inner
            .serializer
            .acquire(volume_key(&req.volume_id), ctx)
            .await?;
        let inner = Arc::clone(&self.inner);
        self.run_locked(ctx, vec![guard], async move {
            inner.unpublish_locked(req).await
        })
        .await
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidationResult, CsiError> {
        require_volume_id(&req.volume_id)?;
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "at least one volume capability is required".into(),
            ));
        }

        let record = self
            .inner
            .registry
            .get(&req.volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(req.volume_id.to_string()))?;

        if !req.volume_context.is_empty() && req.volume_context != record.volume.volume_context {
            return Ok(ValidationResult {
                supported: false,
                message: "volume context does not match the volume".into(),
            });
        }

        let verdict = self
            .inner
            .negotiator
            .negotiate_for_volume(&req.volume_capabilities, &record.capabilities);
        Ok(ValidationResult {
            supported: verdict.supported,
            message: if verdict.supported {
                "supported".into()
            } else {
                verdict.reason
            },
        })
    }

    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, CsiError> {
        let records = self.inner.registry.snapshot();

        let start = match req.starting_token.as_deref() {
            None | Some("") => 0,
            Some(token) => records
                .binary_search_by(|r| r.id().0.as_str().cmp(token))
                .map(|pos| pos + 1)
                .map_err(|_| CsiError::InvalidToken(token.to_owned()))?,
        };

        let page = match req.max_entries {
            0 => self.inner.config.default_page_size as usize,
            n => n as usize,
        };
        let end = if page == 0 {
            records.len()
        } else {
            records.len().min(start.saturating_add(page))
        };

        let next_token = (end < records.len()).then(|| records[end - 1].id().0.clone());
        let entries = records[start..end]
            .iter()
            .map(|r| ListVolumesEntry {
                volume: r.volume.clone(),
                published_node_ids: r.published_node_ids(),
                state: r.state,
            })
            .collect();

        Ok(ListVolumesResponse {
            entries,
            next_token,
        })
    }

    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<u64, CsiError> {
        self.require(self.inner.backend.features().get_capacity, "GetCapacity")?;

        if !req.volume_capabilities.is_empty() {
            let verdict = self.inner.negotiator.negotiate(&req.volume_capabilities);
            if !verdict.supported {
                debug!(reason = %verdict.reason, "no capacity for unsupported capabilities");
                return Ok(0);
            }
        }
        Ok(self
            .inner
            .backend
            .capacity(&req.volume_capabilities)
            .await?)
    }

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        let features = self.inner.backend.features();
        let mut caps = vec![ControllerCapability::CreateDeleteVolume];
        if features.publish_unpublish {
            caps.push(ControllerCapability::PublishUnpublishVolume);
        }
        caps.push(ControllerCapability::ListVolumes);
        if features.get_capacity {
            caps.push(ControllerCapability::GetCapacity);
        }
        Ok(caps)
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl<B: BackendAdapter> CsiIdentity for VolumeController<B> {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.inner.config.plugin_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(self.inner.backend.probe().await?)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}
