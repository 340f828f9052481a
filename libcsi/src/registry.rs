//! Volume identity registry.
//!
//! The registry is the controller's source of idempotency truth: it maps
//! caller-supplied names to volume ids and keeps the last-known record of
//! every volume, attachments included.  Mutations happen only while the
//! matching [`crate::serializer::OperationGuard`] is held; readers always get
//! cloned snapshots.
//!
//! # Persistence
//!
//! A registry opened with [`VolumeRegistry::open`] mirrors itself into
//! `<state_dir>/registry.json` after every mutation (write to a temp file,
//! then rename), so a restarted controller still answers replays correctly.
//! Secrets are not part of a record and are never written.

use std::path::{Path, PathBuf};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CsiError;
use crate::types::{Attachment, NodeId, Volume, VolumeCapability, VolumeId, VolumeState};

const REGISTRY_FILE: &str = "registry.json";
const FORMAT_VERSION: u32 = 1;

/// Everything the controller remembers about one volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRecord {
    /// Name the volume was created under.
    pub name: String,
    /// Descriptor returned to callers.
    pub volume: Volume,
    /// Capabilities requested at creation.
    pub capabilities: Vec<VolumeCapability>,
    /// Attachments, at most one per node.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub state: VolumeState,
}

impl VolumeRecord {
    pub fn new(name: String, volume: Volume, capabilities: Vec<VolumeCapability>) -> Self {
        Self {
            name,
            volume,
            capabilities,
            attachments: Vec::new(),
            state: VolumeState::Provisioned,
        }
    }

    pub fn id(&self) -> &VolumeId {
        &self.volume.volume_id
    }

    pub fn attachment(&self, node_id: &NodeId) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.node_id == *node_id)
    }

    /// Record an attachment, replacing any previous one for the same node.
    pub fn attach(&mut self, attachment: Attachment) {
        self.detach(&attachment.node_id);
        self.attachments.push(attachment);
        self.attachments.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    }

    pub fn detach(&mut self, node_id: &NodeId) -> Option<Attachment> {
        let pos = self.attachments.iter().position(|a| a.node_id == *node_id)?;
        Some(self.attachments.remove(pos))
    }

    pub fn published_node_ids(&self) -> Vec<NodeId> {
        self.attachments.iter().map(|a| a.node_id.clone()).collect()
    }

    /// The non-transient state implied by the attachment set.
    pub fn stable_state(&self) -> VolumeState {
        if self.attachments.is_empty() {
            VolumeState::Provisioned
        } else {
            VolumeState::Published
        }
    }
}

/// On-disk form of the registry.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    records: Vec<VolumeRecord>,
    #[serde(default)]
    tombstones: Vec<VolumeId>,
}

/// Name and id index over volume records.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    by_id: DashMap<VolumeId, VolumeRecord>,
    by_name: DashMap<String, VolumeId>,
    /// Ids of deleted volumes; never handed out again.
    tombstones: DashSet<VolumeId>,
    state_dir: Option<PathBuf>,
    /// Serializes snapshot writes.
    persist_lock: Mutex<()>,
}

impl VolumeRegistry {
    /// A registry that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) a persistent registry under `state_dir`.
    ///
    /// Records left in a transient state by a crash are settled back to the
    /// state their attachments imply.
    pub async fn open(state_dir: impl Into<PathBuf>) -> Result<Self, CsiError> {
        let state_dir = state_dir.into();
        tokio::fs::create_dir_all(&state_dir).await.map_err(|e| {
            CsiError::Internal(format!("create state dir {}: {e}", state_dir.display()))
        })?;

        let registry = Self {
            state_dir: Some(state_dir.clone()),
            ..Self::default()
        };

        let path = state_dir.join(REGISTRY_FILE);
        let json = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no registry snapshot, starting empty");
                return Ok(registry);
            }
            Err(e) => {
                return Err(CsiError::Internal(format!("read {}: {e}", path.display())));
            }
        };

        let file: RegistryFile = serde_json::from_slice(&json)
            .map_err(|e| CsiError::Internal(format!("parse {}: {e}", path.display())))?;
        if file.version != FORMAT_VERSION {
            return Err(CsiError::Internal(format!(
                "unsupported registry format version {} in {}",
                file.version,
                path.display()
            )));
        }

        for mut record in file.records {
            if record.state.is_transient() {
                warn!(volume_id = %record.id(), state = ?record.state, "settling interrupted operation");
                record.state = record.stable_state();
            }
            registry
                .by_name
                .insert(record.name.clone(), record.id().clone());
            registry.by_id.insert(record.id().clone(), record);
        }
        for id in file.tombstones {
            registry.tombstones.insert(id);
        }

        info!(
            state_dir = %state_dir.display(),
            count = registry.by_id.len(),
            "registry recovered",
        );
        Ok(registry)
    }

    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    pub fn lookup_name(&self, name: &str) -> Option<VolumeId> {
        self.by_name.get(name).map(|r| r.value().clone())
    }

    /// Snapshot of a single record.
    pub fn get(&self, volume_id: &VolumeId) -> Option<VolumeRecord> {
        self.by_id.get(volume_id).map(|r| r.value().clone())
    }

    pub fn contains(&self, volume_id: &VolumeId) -> bool {
        self.by_id.contains_key(volume_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Snapshot of every record, ordered by volume id.
    pub fn snapshot(&self) -> Vec<VolumeRecord> {
        let mut records: Vec<_> = self.by_id.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    /// Register a freshly provisioned volume.
    ///
    /// Fails with [`CsiError::VolumeAlreadyExists`] when the name is taken and
    /// with [`CsiError::Internal`] when the id is live or was deleted before.
    pub async fn insert_if_absent(&self, record: VolumeRecord) -> Result<(), CsiError> {
        let id = record.id().clone();
        if self.tombstones.contains(&id) {
            return Err(CsiError::Internal(format!(
                "backend reissued deleted volume id {id}"
            )));
        }

        match self.by_name.entry(record.name.clone()) {
            Entry::Occupied(existing) => {
                return Err(CsiError::VolumeAlreadyExists {
                    name: record.name.clone(),
                    reason: format!("name is registered to volume {}", existing.get()),
                });
            }
            Entry::Vacant(slot) => {
                if self.by_id.contains_key(&id) {
                    return Err(CsiError::Internal(format!(
                        "volume id {id} is already registered under another name"
                    )));
                }
                slot.insert(id.clone());
                self.by_id.insert(id, record);
            }
        }

        self.persist().await
    }

    /// Forget a volume.  Returns the removed record, or `None` when the id
    /// was unknown.
    pub async fn remove_if_present(
        &self,
        volume_id: &VolumeId,
    ) -> Result<Option<VolumeRecord>, CsiError> {
        let Some((_, record)) = self.by_id.remove(volume_id) else {
            return Ok(None);
        };
        self.by_name.remove_if(&record.name, |_, id| id == volume_id);
        self.tombstones.insert(volume_id.clone());

        self.persist().await?;
        Ok(Some(record))
    }

    /// Apply `f` to a record and return the updated snapshot.
    pub async fn update<F>(&self, volume_id: &VolumeId, f: F) -> Result<VolumeRecord, CsiError>
    where
        F: FnOnce(&mut VolumeRecord),
    {
        let updated = {
            let mut entry = self
                .by_id
                .get_mut(volume_id)
                .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;
            f(entry.value_mut());
            entry.value().clone()
        };

        self.persist().await?;
        Ok(updated)
    }

    /// Set the state of a record.
    pub async fn set_state(
        &self,
        volume_id: &VolumeId,
        state: VolumeState,
    ) -> Result<VolumeRecord, CsiError> {
        self.update(volume_id, |r| r.state = state).await
    }

    /// Return a record from a transient state to its stable one.
    pub async fn settle(&self, volume_id: &VolumeId) -> Result<VolumeRecord, CsiError> {
        self.update(volume_id, |r| r.state = r.stable_state()).await
    }

    /// Rewrite the whole state file.
    ///
    /// Every mutation pays for a full snapshot, and the tombstone set is part
    /// of it and never shrinks, so the file and the write cost grow with the
    /// number of volumes ever deleted.
    async fn persist(&self) -> Result<(), CsiError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };

        let _write = self.persist_lock.lock().await;
        let mut tombstones: Vec<_> = self.tombstones.iter().map(|id| id.key().clone()).collect();
        tombstones.sort();
        let file = RegistryFile {
            version: FORMAT_VERSION,
            records: self.snapshot(),
            tombstones,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(CsiError::internal)?;

        let path = dir.join(REGISTRY_FILE);
        let tmp = dir.join(format!("{REGISTRY_FILE}.tmp"));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| CsiError::Internal(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CsiError::Internal(format!("rename to {}: {e}", path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::types::AccessMode;

    fn record(name: &str, id: &str) -> VolumeRecord {
        VolumeRecord::new(
            name.to_owned(),
            Volume {
                volume_id: id.into(),
                capacity_bytes: 1024,
                parameters: HashMap::new(),
                volume_context: HashMap::new(),
            },
            vec![VolumeCapability::mount(AccessMode::SingleNodeWriter)],
        )
    }

    fn attachment(node: &str) -> Attachment {
        Attachment {
            node_id: node.into(),
            capability: VolumeCapability::default(),
            read_only: false,
            publish_context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn insert_and_lookup() {
        let reg = VolumeRegistry::in_memory();
        reg.insert_if_absent(record("pvc-1", "vol-1")).await.unwrap();

        assert_eq!(reg.lookup_name("pvc-1"), Some("vol-1".into()));
        assert_eq!(reg.get(&"vol-1".into()).unwrap().name, "pvc-1");
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let reg = VolumeRegistry::in_memory();
        reg.insert_if_absent(record("pvc-1", "vol-1")).await.unwrap();

        let err = reg
            .insert_if_absent(record("pvc-1", "vol-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::VolumeAlreadyExists { .. }));
        assert!(!reg.contains(&"vol-2".into()));
    }

    #[tokio::test]
    async fn deleted_id_is_never_reused() {
        let reg = VolumeRegistry::in_memory();
        reg.insert_if_absent(record("pvc-1", "vol-1")).await.unwrap();
        assert!(reg.remove_if_present(&"vol-1".into()).await.unwrap().is_some());
        assert!(reg.lookup_name("pvc-1").is_none());

        let err = reg
            .insert_if_absent(record("pvc-2", "vol-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Internal(_)));
    }

    #[tokio::test]
    async fn remove_unknown_is_none() {
        let reg = VolumeRegistry::in_memory();
        assert!(reg.remove_if_present(&"nope".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_is_ordered_and_detached() {
        let reg = VolumeRegistry::in_memory();
        reg.insert_if_absent(record("b", "vol-b")).await.unwrap();
        reg.insert_if_absent(record("a", "vol-a")).await.unwrap();

        let mut snap = reg.snapshot();
        let ids: Vec<_> = snap.iter().map(|r| r.id().0.clone()).collect();
        assert_eq!(ids, ["vol-a", "vol-b"]);

        // Mutating a snapshot must not leak back into the registry.
        snap[0].attach(attachment("node-a"));
        assert!(reg.get(&"vol-a".into()).unwrap().attachments.is_empty());
    }

    #[tokio::test]
    async fn attachments_keyed_by_node() {
        let mut rec = record("pvc", "vol");
        rec.attach(attachment("node-b"));
        rec.attach(attachment("node-a"));
        rec.attach(attachment("node-a"));
        let expected: Vec<NodeId> = vec!["node-a".into(), "node-b".into()];
        assert_eq!(rec.published_node_ids(), expected);
        assert_eq!(rec.stable_state(), VolumeState::Published);

        rec.detach(&"node-a".into());
        rec.detach(&"node-b".into());
        assert_eq!(rec.stable_state(), VolumeState::Provisioned);
    }

    #[tokio::test]
    async fn persists_and_recovers() {
        let tmp = tempfile::tempdir().unwrap();

        {
            let reg = VolumeRegistry::open(tmp.path()).await.unwrap();
            reg.insert_if_absent(record("keep", "vol-keep")).await.unwrap();
            reg.insert_if_absent(record("gone", "vol-gone")).await.unwrap();
            reg.update(&"vol-keep".into(), |r| {
                r.attach(attachment("node-a"));
                r.state = VolumeState::Unpublishing;
            })
            .await
            .unwrap();
            reg.remove_if_present(&"vol-gone".into()).await.unwrap();
        }

        let reg = VolumeRegistry::open(tmp.path()).await.unwrap();
        assert_eq!(reg.len(), 1);
        let rec = reg.get(&"vol-keep".into()).unwrap();
        // The interrupted unpublish is settled on recovery.
        assert_eq!(rec.state, VolumeState::Published);
        assert_eq!(rec.attachments.len(), 1);
        assert_eq!(reg.lookup_name("keep"), Some("vol-keep".into()));

        let err = reg
            .insert_if_absent(record("again", "vol-gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Internal(_)));
    }

    #[tokio::test]
    async fn state_file_keeps_every_tombstone() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = VolumeRegistry::open(tmp.path()).await.unwrap();
        for i in 0..3 {
            let id = format!("vol-{i}");
            reg.insert_if_absent(record(&format!("v{i}"), &id)).await.unwrap();
            reg.remove_if_present(&id.as_str().into()).await.unwrap();
        }

        let raw = std::fs::read(tmp.path().join(REGISTRY_FILE)).unwrap();
        let file: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(file["records"].as_array().unwrap().len(), 0);
        assert_eq!(
            file["tombstones"],
            serde_json::json!(["vol-0", "vol-1", "vol-2"])
        );
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let reg = VolumeRegistry::in_memory();
        let err = reg
            .set_state(&"nope".into(), VolumeState::Publishing)
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::VolumeNotFound(_)));
    }
}
