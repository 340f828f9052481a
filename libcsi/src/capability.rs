//! Capability negotiation.
//!
//! Backends declare the `(access mode, access type)` combinations they can
//! serve once, at startup.  [`CapabilityNegotiator`] checks requests against
//! that declaration (and optionally against what a volume was created with)
//! without ever calling the backend.

use serde::{Deserialize, Serialize};

use crate::types::{AccessMode, AccessType, AccessTypeKind, VolumeCapability};

/// A single combination a backend can serve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CapabilitySupport {
    pub access_mode: AccessMode,
    pub access_type: AccessTypeKind,
}

impl CapabilitySupport {
    pub const fn new(access_mode: AccessMode, access_type: AccessTypeKind) -> Self {
        Self {
            access_mode,
            access_type,
        }
    }

    fn admits(&self, cap: &VolumeCapability) -> bool {
        self.access_mode == cap.access_mode && self.access_type == cap.access_type.kind()
    }
}

/// Verdict of a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub supported: bool,
    /// Empty when supported.
    pub reason: String,
}

impl Negotiation {
    fn ok() -> Self {
        Self {
            supported: true,
            reason: String::new(),
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            supported: false,
            reason,
        }
    }
}

/// Pure checker over a backend's static capability declaration.
#[derive(Debug, Clone)]
pub struct CapabilityNegotiator {
    supported: Vec<CapabilitySupport>,
}

impl CapabilityNegotiator {
    pub fn new(supported: Vec<CapabilitySupport>) -> Self {
        Self { supported }
    }

    /// The declaration this negotiator checks against.
    pub fn supported(&self) -> &[CapabilitySupport] {
        &self.supported
    }

    /// Check `requested` against the backend declaration alone.
    pub fn negotiate(&self, requested: &[VolumeCapability]) -> Negotiation {
        for cap in requested {
            if !self.supported.iter().any(|s| s.admits(cap)) {
                return Negotiation::rejected(format!(
                    "access mode {} with {} access type is not supported by the backend",
                    cap.access_mode,
                    cap.access_type.kind()
                ));
            }
        }
        Negotiation::ok()
    }

    /// Check `requested` against the backend declaration and against the
    /// capabilities an existing volume was created with.
    pub fn negotiate_for_volume(
        &self,
        requested: &[VolumeCapability],
        recorded: &[VolumeCapability],
    ) -> Negotiation {
        let verdict = self.negotiate(requested);
        if !verdict.supported {
            return verdict;
        }
        match requested.iter().find(|cap| !covered_by(cap, recorded)) {
            Some(cap) => Negotiation::rejected(format!(
                "capability {cap} was not requested when the volume was created"
            )),
            None => Negotiation::ok(),
        }
    }
}

/// `true` when some capability in `recorded` admits `cap`.
///
/// A mount capability with an empty fs type matches any fs type, so a caller
/// that leaves the choice to the backend is never rejected over it.
pub fn covered_by(cap: &VolumeCapability, recorded: &[VolumeCapability]) -> bool {
    recorded.iter().any(|r| {
        r.access_mode == cap.access_mode
            && match (&r.access_type, &cap.access_type) {
                (AccessType::Block, AccessType::Block) => true,
                (AccessType::Mount { fs_type: have, .. }, AccessType::Mount { fs_type: want, .. }) => {
                    have.is_empty() || want.is_empty() || have == want
                }
                _ => false,
            }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator() -> CapabilityNegotiator {
        CapabilityNegotiator::new(vec![
            CapabilitySupport::new(AccessMode::SingleNodeWriter, AccessTypeKind::Mount),
            CapabilitySupport::new(AccessMode::SingleNodeWriter, AccessTypeKind::Block),
            CapabilitySupport::new(AccessMode::MultiNodeReaderOnly, AccessTypeKind::Mount),
        ])
    }

    #[test]
    fn supported_combinations_pass() {
        let verdict = negotiator().negotiate(&[
            VolumeCapability::mount(AccessMode::SingleNodeWriter),
            VolumeCapability::block(AccessMode::SingleNodeWriter),
        ]);
        assert!(verdict.supported);
        assert!(verdict.reason.is_empty());
    }

    #[test]
    fn unsupported_mode_is_rejected_with_reason() {
        let verdict =
            negotiator().negotiate(&[VolumeCapability::mount(AccessMode::MultiNodeMultiWriter)]);
        assert!(!verdict.supported);
        assert!(verdict.reason.contains("MULTI_NODE_MULTI_WRITER"));
    }

    #[test]
    fn unsupported_access_type_is_rejected() {
        let verdict =
            negotiator().negotiate(&[VolumeCapability::block(AccessMode::MultiNodeReaderOnly)]);
        assert!(!verdict.supported);
        assert!(verdict.reason.contains("block"));
    }

    #[test]
    fn volume_negotiation_requires_recorded_capability() {
        let recorded = [VolumeCapability::mount(AccessMode::SingleNodeWriter)];
        let n = negotiator();

        assert!(
            n.negotiate_for_volume(&[VolumeCapability::mount(AccessMode::SingleNodeWriter)], &recorded)
                .supported
        );

        let verdict = n.negotiate_for_volume(
            &[VolumeCapability::block(AccessMode::SingleNodeWriter)],
            &recorded,
        );
        assert!(!verdict.supported);
        assert!(!verdict.reason.is_empty());
    }

    #[test]
    fn fs_type_mismatch_is_not_covered() {
        let ext4 = VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Mount {
                fs_type: "ext4".into(),
                mount_flags: vec![],
            },
        };
        let xfs = VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Mount {
                fs_type: "xfs".into(),
                mount_flags: vec![],
            },
        };
        assert!(!covered_by(&xfs, &[ext4.clone()]));
        assert!(covered_by(
            &VolumeCapability::mount(AccessMode::SingleNodeWriter),
            &[ext4]
        ));
    }
}
