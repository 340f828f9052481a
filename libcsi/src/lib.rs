//! # libcsi: CSI volume lifecycle controller for RK8s
//!
//! `libcsi` implements the controller side of the [Container Storage
//! Interface][csi]: creating and deleting volumes, publishing them to nodes,
//! validating capabilities, listing and capacity reporting.  Every mutating
//! operation is idempotent and serialized per volume, so an orchestrator may
//! retry freely.  Requests travel over QUIC (via [`quinn`]) instead of gRPC.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] and its [`ErrorCode`] classification. |
//! | [`config`] | [`ControllerConfig`] from defaults, YAML or environment. |
//! | [`capability`] | Capability negotiation against a backend's declaration. |
//! | [`registry`] | Volume identity registry, optionally persisted to disk. |
//! | [`serializer`] | Per-volume operation locks and [`CallContext`]. |
//! | [`lifecycle`] | [`VolumeController`], the controller state machine. |
//! | [`identity`] | [`CsiIdentity`] trait, plugin discovery and health. |
//! | [`controller`] | [`CsiController`] trait, the controller RPCs. |
//! | [`message`] | [`CsiMessage`] protocol envelope and request dispatch. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | Storage backends: local directories and in-memory. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod capability;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod serializer;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::{BackendAdapter, BackendError, BackendFeatures};
pub use capability::{CapabilityNegotiator, CapabilitySupport};
pub use config::{ControllerConfig, UnpublishPolicy};
pub use controller::CsiController;
pub use error::{CsiError, ErrorCode};
pub use identity::CsiIdentity;
pub use lifecycle::{ReconcileReport, VolumeController};
pub use message::CsiMessage;
pub use registry::{VolumeRecord, VolumeRegistry};
pub use serializer::{CallContext, OperationSerializer};
pub use types::*;
