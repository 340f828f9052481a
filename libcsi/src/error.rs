//! CSI error types.
//!
//! All errors surfaced by the controller are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer unchanged.
//!
//! Each variant belongs to exactly one [`ErrorCode`] class.  The class tells
//! the orchestrator whether (and how) a request may be retried.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;

/// Error classes understood by the orchestrator.
///
/// These mirror the subset of gRPC status codes used by the CSI controller
/// contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed or unsupported request; do not retry without changes.
    InvalidArgument,
    /// The referenced volume is absent.
    NotFound,
    /// Name or attachment conflict with an existing object.
    AlreadyExists,
    /// Blocked by the current state of the volume.
    FailedPrecondition,
    /// Transient conflict; safe to retry immediately.
    Aborted,
    /// Backend capacity or quota exhausted.
    ResourceExhausted,
    /// The caller gave up on the request.
    Cancelled,
    /// The operation is not offered by the configured backend.
    Unimplemented,
    /// Backend adapter failure or registry invariant violation.
    Internal,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// A volume with the same name exists with incompatible parameters.
    #[error("volume {name} already exists: {reason}")]
    VolumeAlreadyExists {
        /// Caller-supplied volume name.
        name: String,
        /// Why the existing volume does not satisfy the request.
        reason: String,
    },

    /// The volume is already published to the node with other parameters.
    #[error("volume {volume_id} already published to node {node_id} with a different capability")]
    ConflictingAttachment {
        /// Volume being published.
        volume_id: String,
        /// Node that already holds an attachment.
        node_id: String,
    },

    /// The operation is blocked by the current state of the volume.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Another mutating operation holds the same key.
    #[error("operation pending for {0}")]
    OperationPending(String),

    /// A `ListVolumes` starting token is not (or no longer) valid.
    #[error("invalid starting token {0:?}, restart listing from the beginning")]
    InvalidToken(String),

    /// The backend is out of capacity.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The caller cancelled the request before it took effect.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The backend does not offer this operation.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// The storage backend returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// The orchestrator-facing class of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::VolumeNotFound(_) => ErrorCode::NotFound,
            Self::VolumeAlreadyExists { .. } | Self::ConflictingAttachment { .. } => {
                ErrorCode::AlreadyExists
            }
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::OperationPending(_) | Self::InvalidToken(_) => ErrorCode::Aborted,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::Unimplemented(_) => ErrorCode::Unimplemented,
            Self::BackendError(_) | Self::TransportError(_) | Self::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<BackendError> for CsiError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(id) => Self::VolumeNotFound(id),
            BackendError::CapacityExhausted(msg) => Self::ResourceExhausted(msg),
            BackendError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            BackendError::Failed(msg) => Self::BackendError(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::VolumeNotFound("vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 not found");
    }

    #[test]
    fn aborted_class_covers_lock_and_token() {
        assert_eq!(
            CsiError::OperationPending("vol-1".into()).code(),
            ErrorCode::Aborted
        );
        assert_eq!(
            CsiError::InvalidToken("bogus".into()).code(),
            ErrorCode::Aborted
        );
    }

    #[test]
    fn backend_errors_map_into_taxonomy() {
        let err: CsiError = BackendError::CapacityExhausted("pool full".into()).into();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);

        let err: CsiError = BackendError::Failed("disk on fire".into()).into();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::ConflictingAttachment {
            volume_id: "vol-1".into(),
            node_id: "node-a".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
        assert_eq!(de.code(), ErrorCode::AlreadyExists);
    }
}
