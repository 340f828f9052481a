//! Core CSI types: volumes, capabilities, attachments and requests.
//!
//! These types form the data model shared by the controller traits, the
//! registry, the transport layer and backend implementations.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
///
/// Ordered so that listings are deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a node a volume can be published to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read-write on a single node.
    SingleNodeWriter,
    /// Read-only on a single node.
    SingleNodeReaderOnly,
    /// Read-only on many nodes.
    MultiNodeReaderOnly,
    /// Many nodes, one of them read-write.
    MultiNodeSingleWriter,
    /// Read-write on many nodes.
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// `true` when the mode permits attachment to at most one node.
    pub fn is_single_node(self) -> bool {
        matches!(self, Self::SingleNodeWriter | Self::SingleNodeReaderOnly)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SingleNodeWriter => "SINGLE_NODE_WRITER",
            Self::SingleNodeReaderOnly => "SINGLE_NODE_READER_ONLY",
            Self::MultiNodeReaderOnly => "MULTI_NODE_READER_ONLY",
            Self::MultiNodeSingleWriter => "MULTI_NODE_SINGLE_WRITER",
            Self::MultiNodeMultiWriter => "MULTI_NODE_MULTI_WRITER",
        };
        f.write_str(s)
    }
}

/// How the volume is consumed on the node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// Raw block device.
    Block,
    /// Mounted filesystem.
    Mount {
        /// Filesystem type; empty means the backend default.
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
}

impl AccessType {
    /// The variant tag, without mount parameters.
    pub fn kind(&self) -> AccessTypeKind {
        match self {
            Self::Block => AccessTypeKind::Block,
            Self::Mount { .. } => AccessTypeKind::Mount,
        }
    }
}

/// Parameter-free tag of an [`AccessType`], used for backend declarations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessTypeKind {
    /// Raw block device.
    Block,
    /// Mounted filesystem.
    Mount,
}

impl fmt::Display for AccessTypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::Mount => f.write_str("mount"),
        }
    }
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Requested access type.
    pub access_type: AccessType,
}

impl VolumeCapability {
    /// A mounted-filesystem capability using the backend's default fs type.
    pub fn mount(access_mode: AccessMode) -> Self {
        Self {
            access_mode,
            access_type: AccessType::Mount {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            },
        }
    }

    /// A raw block capability.
    pub fn block(access_mode: AccessMode) -> Self {
        Self {
            access_mode,
            access_type: AccessType::Block,
        }
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::mount(AccessMode::SingleNodeWriter)
    }
}

impl fmt::Display for VolumeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.access_mode, self.access_type.kind())
    }
}

// ---------------------------------------------------------------------------
// Capacity & secrets
// ---------------------------------------------------------------------------

/// Requested capacity bounds.  A zero field is unset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    /// The volume must be at least this large.
    #[serde(default)]
    pub required_bytes: u64,
    /// The volume must not be larger than this.
    #[serde(default)]
    pub limit_bytes: u64,
}

impl CapacityRange {
    /// Range with only a lower bound.
    pub fn at_least(required_bytes: u64) -> Self {
        Self {
            required_bytes,
            limit_bytes: 0,
        }
    }

    /// `true` when `bytes` lies within both bounds that are set.
    pub fn contains(&self, bytes: u64) -> bool {
        bytes >= self.required_bytes && (self.limit_bytes == 0 || bytes <= self.limit_bytes)
    }

    /// `true` when both bounds are set and contradict each other.
    pub fn is_inverted(&self) -> bool {
        self.limit_bytes != 0 && self.required_bytes > self.limit_bytes
    }
}

/// Opaque credentials passed through to the backend.
///
/// Values never show up in `Debug` output, so they cannot leak through
/// tracing spans or log lines.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secrets(pub HashMap<String, String>);

impl Secrets {
    /// Look up a single credential.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.0.keys().collect();
        keys.sort();
        write!(f, "Secrets({keys:?}: <redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// Descriptor of a provisioned volume, as returned to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// User-supplied parameters from the storage class / request.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// A volume published to a specific node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    /// The node holding the attachment.
    pub node_id: NodeId,
    /// Capability the volume was published with.
    pub capability: VolumeCapability,
    /// Whether the node got read-only access.
    pub read_only: bool,
    /// Context handed to node-local mount logic.
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
}

impl Attachment {
    /// `true` when a publish with these parameters would replay this one.
    pub fn matches(&self, capability: &VolumeCapability, read_only: bool) -> bool {
        self.capability == *capability && self.read_only == read_only
    }
}

// ---------------------------------------------------------------------------
// Volume lifecycle state
// ---------------------------------------------------------------------------

/// Lifecycle state of a registered volume.
///
/// The `*ing` states are transient: they are only observable while the
/// per-volume lock is held by the operation that set them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeState {
    /// Provisioned with no attachments.
    Provisioned,
    /// A backend attach is in flight.
    Publishing,
    /// At least one attachment exists.
    Published,
    /// A backend detach is in flight.
    Unpublishing,
    /// A backend deprovision is in flight.
    Deprovisioning,
}

impl VolumeState {
    /// `true` for states only held while an operation runs.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Publishing | Self::Unpublishing | Self::Deprovisioning
        )
    }
}

// ---------------------------------------------------------------------------
// Requests & responses
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Caller-supplied name; the idempotency key.
    pub name: String,
    /// Desired capacity; `None` leaves the size to the backend.
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Arbitrary parameters forwarded to the backend.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Credentials forwarded to the backend.
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request to delete a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    /// Volume to delete.
    pub volume_id: VolumeId,
    /// Credentials forwarded to the backend.
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request to make a volume available on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Target node.
    pub node_id: NodeId,
    /// Capability the node will use the volume with.
    pub volume_capability: VolumeCapability,
    /// Whether the node gets read-only access.
    #[serde(default)]
    pub read_only: bool,
    /// Credentials forwarded to the backend.
    #[serde(default)]
    pub secrets: Secrets,
    /// Context returned by `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to withdraw a volume from one node or from all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    /// Volume to unpublish.
    pub volume_id: VolumeId,
    /// Node to detach from; `None` (or an empty id) means every node.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Credentials forwarded to the backend.
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request to check capabilities against an existing volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    /// Volume to check.
    pub volume_id: VolumeId,
    /// Capabilities the caller wants to use.
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Context returned by `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Outcome of a capability validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    /// Whether every requested capability is supported.
    pub supported: bool,
    /// `"supported"`, or the reason the capabilities were rejected.
    pub message: String,
}

/// Request for one page of volumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    /// Page size; `0` uses the controller's default.
    #[serde(default)]
    pub max_entries: u32,
    /// Token returned by the previous page.
    #[serde(default)]
    pub starting_token: Option<String>,
}

/// A single row of a volume listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVolumesEntry {
    /// The volume descriptor.
    pub volume: Volume,
    /// Nodes the volume is currently published to.
    #[serde(default)]
    pub published_node_ids: Vec<NodeId>,
    /// Current lifecycle state.
    pub state: VolumeState,
}

/// One page of volumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesResponse {
    /// Entries ordered by volume id.
    pub entries: Vec<ListVolumesEntry>,
    /// Token for the next page, `None` on the last page.
    #[serde(default)]
    pub next_token: Option<String>,
}

/// Request for available capacity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCapacityRequest {
    /// Only count capacity usable with these capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// RPCs offered by the controller service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    /// `CreateVolume` and `DeleteVolume`.
    CreateDeleteVolume,
    /// `ControllerPublishVolume` and `ControllerUnpublishVolume`.
    PublishUnpublishVolume,
    /// `ListVolumes`.
    ListVolumes,
    /// `GetCapacity`.
    GetCapacity,
}

// ---------------------------------------------------------------------------
// Plugin info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"rk8s.localdir.csi"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}
