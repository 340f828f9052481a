//! Local directory backend.
//!
//! [`LocalDirBackend`] stores each volume as a directory under a root path.
//! Nodes are granted access by recording them in the volume's metadata
//! sidecar; the publish context carries the directory path for the node
//! plugin to bind-mount.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/
//!   <volume-id>/            # volume data
//!   <volume-id>.meta.json   # volume descriptor and node grants (used for recovery)
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{BackendAdapter, BackendError, BackendFeatures, ProvisionedVolume};
use crate::capability::CapabilitySupport;
use crate::types::*;

const DEFAULT_VOLUME_BYTES: u64 = 1024 * 1024 * 1024;
const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct NodeGrant {
    node_id: NodeId,
    read_only: bool,
}

/// Contents of a `<volume-id>.meta.json` sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VolumeMeta {
    name: String,
    volume: Volume,
    #[serde(default)]
    grants: Vec<NodeGrant>,
}

/// Backend keeping volumes as directories on a local filesystem.
#[derive(Debug)]
pub struct LocalDirBackend {
    root: PathBuf,
    volumes: DashMap<VolumeId, VolumeMeta>,
    default_volume_bytes: u64,
}

impl LocalDirBackend {
    /// Create a backend rooted at `root`.
    ///
    /// Call [`Self::recover`] afterwards to pick up volumes from a previous
    /// run.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            volumes: DashMap::new(),
            default_volume_bytes: DEFAULT_VOLUME_BYTES,
        }
    }

    /// Size used when a request carries no capacity range.
    pub fn with_default_volume_bytes(mut self, bytes: u64) -> Self {
        self.default_volume_bytes = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn volume_root(&self, volume_id: &VolumeId) -> PathBuf {
        self.root.join(&volume_id.0)
    }

    fn meta_path(&self, volume_id: &VolumeId) -> PathBuf {
        self.root.join(format!("{}{META_SUFFIX}", volume_id.0))
    }

    /// Rebuild the in-memory index from the sidecars under the root.
    ///
    /// Sidecars that cannot be read or whose directory is gone are skipped
    /// with a warning.  Returns the number of volumes recovered.
    pub async fn recover(&self) -> Result<usize, BackendError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(BackendError::Failed(format!(
                    "read_dir {}: {e}",
                    self.root.display()
                )));
            }
        };

        while let Some(entry) = dir.next_entry().await.map_err(BackendError::failed)? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(META_SUFFIX) {
                continue;
            }

            let json = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read volume metadata, skipping");
                    continue;
                }
            };
            let meta: VolumeMeta = match serde_json::from_str(&json) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse volume metadata, skipping");
                    continue;
                }
            };

            let id = meta.volume.volume_id.clone();
            if !self.volume_root(&id).is_dir() {
                warn!(volume_id = %id, "volume directory missing, skipping recovery");
                continue;
            }
            self.volumes.insert(id, meta);
        }

        info!(root = %self.root.display(), count = self.volumes.len(), "recovery complete");
        Ok(self.volumes.len())
    }

    fn free_bytes(&self) -> Result<u64, BackendError> {
        let stat = nix::sys::statvfs::statvfs(self.root.as_path())
            .map_err(|e| BackendError::Failed(format!("statvfs {}: {e}", self.root.display())))?;
        Ok(stat.fragment_size().saturating_mul(stat.blocks_available()))
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

    /// Write the sidecar through a temporary file so readers never see a
    /// partial document.
    async fn write_meta(&self, meta: &VolumeMeta) -> Result<(), BackendError> {
        let id = &meta.volume.volume_id;
        let path = self.meta_path(id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(meta).map_err(BackendError::failed)?;

        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| BackendError::Failed(format!("write meta {id}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| BackendError::Failed(format!("commit meta {id}: {e}")))
    }

    fn meta(&self, volume_id: &VolumeId) -> Result<VolumeMeta, BackendError> {
        self.volumes
            .get(volume_id)
            .map(|m| m.value().clone())
            .ok_or_else(|| BackendError::NotFound(volume_id.to_string()))
    }
}

#[async_trait]
impl BackendAdapter for LocalDirBackend {
    fn supported_capabilities(&self) -> Vec<CapabilitySupport> {
        [
            AccessMode::SingleNodeWriter,
            AccessMode::SingleNodeReaderOnly,
            AccessMode::MultiNodeReaderOnly,
            AccessMode::MultiNodeSingleWriter,
            AccessMode::MultiNodeMultiWriter,
        ]
        .into_iter()
        .map(|mode| CapabilitySupport::new(mode, AccessTypeKind::Mount))
        .collect()
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            publish_unpublish: true,
            get_capacity: true,
        }
    }

    async fn provision(
        &self,
        name: &str,
        capacity: Option<CapacityRange>,
        _capabilities: &[VolumeCapability],
        parameters: &HashMap<String, String>,
        _secrets: &Secrets,
    ) -> Result<ProvisionedVolume, BackendError> {
        let size = self.resolve_size(capacity)?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| BackendError::Failed(format!("create dir {}: {e}", self.root.display())))?;
        let free = self.free_bytes()?;
        if size > free {
            return Err(BackendError::CapacityExhausted(format!(
                "requested {size} bytes, {free} free under {}",
                self.root.display()
            )));
        }

        let volume_id = VolumeId(format!("localdir-{}", uuid::Uuid::new_v4()));
        let vol_root = self.volume_root(&volume_id);
        tokio::fs::create_dir_all(&vol_root)
            .await
            .map_err(|e| BackendError::Failed(format!("create dir {}: {e}", vol_root.display())))?;

        let volume_context = HashMap::from([(
            "path".to_owned(),
            vol_root.to_string_lossy().into_owned(),
        )]);
        let meta = VolumeMeta {
            name: name.to_owned(),
            volume: Volume {
                volume_id: volume_id.clone(),
                capacity_bytes: size,
                parameters: parameters.clone(),
                volume_context: volume_context.clone(),
            },
            grants: Vec::new(),
        };

        // The sidecar is the commit point: without it the directory is not
        // recovered.
        if let Err(e) = self.write_meta(&meta).await {
            let _ = tokio::fs::remove_dir_all(&vol_root).await;
            return Err(e);
        }
        self.volumes.insert(volume_id.clone(), meta);

        debug!(%name, %volume_id, size, "volume directory created");
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
        let vol_root = self.volume_root(volume_id);
        let meta_path = self.meta_path(volume_id);
        if !self.volumes.contains_key(volume_id) && !vol_root.exists() && !meta_path.exists() {
            return Err(BackendError::NotFound(volume_id.to_string()));
        }

        // Data goes first so a failed removal leaves a recoverable volume.
        if vol_root.exists() {
            tokio::fs::remove_dir_all(&vol_root)
                .await
                .map_err(|e| BackendError::Failed(format!("remove dir {}: {e}", vol_root.display())))?;
        }
        if meta_path.exists() {
            tokio::fs::remove_file(&meta_path)
                .await
                .map_err(|e| BackendError::Failed(format!("remove meta {}: {e}", meta_path.display())))?;
        }
        self.volumes.remove(volume_id);

        debug!(%volume_id, "volume directory removed");
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
        let mut meta = self.meta(volume_id)?;
        meta.grants.retain(|g| &g.node_id != node_id);
        meta.grants.push(NodeGrant {
            node_id: node_id.clone(),
            read_only,
        });
        meta.grants.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        self.write_meta(&meta).await?;
        self.volumes.insert(volume_id.clone(), meta);

        Ok(HashMap::from([
            (
                "path".to_owned(),
                self.volume_root(volume_id).to_string_lossy().into_owned(),
            ),
            ("readOnly".to_owned(), read_only.to_string()),
        ]))
    }

    async fn detach(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        _secrets: &Secrets,
    ) -> Result<(), BackendError> {
        let mut meta = self.meta(volume_id)?;
        let before = meta.grants.len();
        meta.grants.retain(|g| &g.node_id != node_id);
        if meta.grants.len() == before {
            debug!(%volume_id, %node_id, "node holds no grant");
            return Ok(());
        }
        self.write_meta(&meta).await?;
        self.volumes.insert(volume_id.clone(), meta);
        Ok(())
    }

    async fn describe(&self, volume_id: &VolumeId) -> Result<Volume, BackendError> {
        self.meta(volume_id).map(|m| m.volume)
    }

    async fn capacity(&self, _capabilities: &[VolumeCapability]) -> Result<u64, BackendError> {
        self.free_bytes()
    }

    async fn list(&self) -> Result<Vec<Volume>, BackendError> {
        Ok(self
            .volumes
            .iter()
            .map(|m| m.value().volume.clone())
            .collect())
    }

    async fn probe(&self) -> Result<bool, BackendError> {
        Ok(tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }
}
