//! Controller configuration.
//!
//! Defaults can be overridden from a YAML document or from environment
//! variables:
//! - `LIBCSI_PLUGIN_NAME`: name reported by `GetPluginInfo`.
//! - `LIBCSI_LOCK_WAIT_MS`: how long a mutating request waits behind another
//!   one on the same volume before failing with `Aborted`. Defaults to `0`
//!   (fail fast).
//! - `LIBCSI_UNPUBLISH_POLICY`: `best-effort` (default) or
//!   `stop-on-first-error`.
//! - `LIBCSI_PAGE_SIZE`: `ListVolumes` page size when the caller sends `0`.
//!   `0` means unbounded.
//! - `LIBCSI_STATE_DIR`: directory for the persistent registry. Unset keeps
//!   the registry in memory.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;

const DEFAULT_PLUGIN_NAME: &str = "rk8s.localdir.csi";
const DEFAULT_PAGE_SIZE: u32 = 256;

/// What `ControllerUnpublishVolume` does when detaching from one of several
/// nodes fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UnpublishPolicy {
    /// Try every node, drop the attachments that detached, report the first
    /// failure.
    #[default]
    BestEffort,
    /// Stop at the first failing node; later nodes are not attempted.
    StopOnFirstError,
}

impl FromStr for UnpublishPolicy {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best-effort" => Ok(Self::BestEffort),
            "stop-on-first-error" => Ok(Self::StopOnFirstError),
            other => Err(CsiError::InvalidArgument(format!(
                "unknown unpublish policy {other:?}"
            ))),
        }
    }
}

/// Tunables of the volume lifecycle controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    pub plugin_name: String,
    pub lock_wait_ms: u64,
    pub unpublish_policy: UnpublishPolicy,
    pub default_page_size: u32,
    pub state_dir: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            plugin_name: DEFAULT_PLUGIN_NAME.to_owned(),
            lock_wait_ms: 0,
            unpublish_policy: UnpublishPolicy::default(),
            default_page_size: DEFAULT_PAGE_SIZE,
            state_dir: None,
        }
    }
}

impl ControllerConfig {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Parse a YAML document; missing keys keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CsiError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CsiError::InvalidArgument(format!("controller config: {e}")))
    }

    /// Defaults overridden by `LIBCSI_*` environment variables.
    pub fn from_env() -> Result<Self, CsiError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, CsiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("LIBCSI_PLUGIN_NAME") {
            self.plugin_name = name;
        }
        if let Some(ms) = lookup("LIBCSI_LOCK_WAIT_MS") {
            self.lock_wait_ms = parse_number("LIBCSI_LOCK_WAIT_MS", &ms)?;
        }
        if let Some(policy) = lookup("LIBCSI_UNPUBLISH_POLICY") {
            self.unpublish_policy = policy.parse()?;
        }
        if let Some(size) = lookup("LIBCSI_PAGE_SIZE") {
            self.default_page_size = parse_number("LIBCSI_PAGE_SIZE", &size)?;
        }
        if let Some(dir) = lookup("LIBCSI_STATE_DIR").filter(|d| !d.is_empty()) {
            self.state_dir = Some(PathBuf::from(dir));
        }
        Ok(self)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, CsiError> {
    value
        .trim()
        .parse()
        .map_err(|_| CsiError::InvalidArgument(format!("{key}: {value:?} is not a number")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.lock_wait(), Duration::ZERO);
        assert_eq!(cfg.unpublish_policy, UnpublishPolicy::BestEffort);
        assert_eq!(cfg.default_page_size, DEFAULT_PAGE_SIZE);
        assert!(cfg.state_dir.is_none());
    }

    #[test]
    fn yaml_overrides_only_given_keys() {
        let cfg = ControllerConfig::from_yaml_str(
            "lock_wait_ms: 250\nunpublish_policy: stop-on-first-error\n",
        )
        .unwrap();
        assert_eq!(cfg.lock_wait(), Duration::from_millis(250));
        assert_eq!(cfg.unpublish_policy, UnpublishPolicy::StopOnFirstError);
        assert_eq!(cfg.plugin_name, DEFAULT_PLUGIN_NAME);
    }

    #[test]
    fn env_overrides() {
        let vars = HashMap::from([
            ("LIBCSI_LOCK_WAIT_MS", "40"),
            ("LIBCSI_UNPUBLISH_POLICY", "stop-on-first-error"),
            ("LIBCSI_PAGE_SIZE", "10"),
            ("LIBCSI_STATE_DIR", "/var/lib/libcsi"),
        ]);
        let cfg = ControllerConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.lock_wait_ms, 40);
        assert_eq!(cfg.unpublish_policy, UnpublishPolicy::StopOnFirstError);
        assert_eq!(cfg.default_page_size, 10);
        assert_eq!(cfg.state_dir, Some(PathBuf::from("/var/lib/libcsi")));
    }

    #[test]
    fn bad_env_value_is_rejected() {
        let err = ControllerConfig::default()
            .with_overrides(|k| (k == "LIBCSI_LOCK_WAIT_MS").then(|| "soon".to_owned()))
            .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));

        let err = ControllerConfig::default()
            .with_overrides(|k| (k == "LIBCSI_UNPUBLISH_POLICY").then(|| "yolo".to_owned()))
            .unwrap_err();
        assert!(err.to_string().contains("yolo"));
    }
}
