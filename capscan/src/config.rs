//! Configuration for the capscan engine
//!
//! Loaded from TOML (`CapscanConfig::from_file`) and overlaid with
//! `CAPSCAN_*` environment variables. Every section has serde defaults so a
//! partial file is valid.

use crate::error::CapabilityError;
use crate::probe::PollPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapscanConfig {
    pub walk: WalkConfig,
    pub scan: ScanConfig,
    pub invoke: InvokeConfig,
    pub upload_poll: PollConfig,
    /// Sent messages show up more slowly than queued uploads.
    #[serde(default = "default_message_poll")]
    pub message_poll: PollConfig,
    pub dispatch: DispatchConfig,
}

fn default_message_poll() -> PollConfig {
    PollConfig::new(120, 4500)
}

impl Default for CapscanConfig {
    fn default() -> Self {
        Self {
            walk: WalkConfig::default(),
            scan: ScanConfig::default(),
            invoke: InvokeConfig::default(),
            upload_poll: PollConfig::default(),
            message_poll: default_message_poll(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// Graph walker budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkConfig {
    pub max_nodes: usize,
    pub max_depth: usize,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            max_nodes: 4000,
            max_depth: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Upper bound on modules evaluated because of source-text hints.
    pub evaluate_top_n: usize,
    /// Entries kept in the diagnostic summary.
    pub diagnostic_top_k: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            evaluate_top_n: 8,
            diagnostic_top_k: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeConfig {
    /// How long to wait for an asynchronous return when there is no probe.
    pub settle_timeout_ms: u64,
    /// Per-candidate messages carried by the aggregate error.
    pub max_reported_failures: usize,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            settle_timeout_ms: 1500,
            max_reported_failures: 3,
        }
    }
}

impl InvokeConfig {
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub deadline_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            deadline_ms: 1800,
        }
    }
}

impl PollConfig {
    pub fn new(interval_ms: u64, deadline_ms: u64) -> Self {
        Self {
            interval_ms,
            deadline_ms,
        }
    }

    pub fn policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.interval_ms),
            Duration::from_millis(self.deadline_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Pause between a confirmed queue and the send call.
    pub send_delay_ms: u64,
    /// Pause used instead when there was no upload store to confirm against.
    pub unconfirmed_send_delay_ms: u64,
    /// Staged files are removed this long after dispatch finishes.
    pub cleanup_delay_ms: u64,
    pub cache_dir: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_delay_ms: 220,
            unconfirmed_send_delay_ms: 360,
            cleanup_delay_ms: 15_000,
            cache_dir: std::env::temp_dir().join("capscan"),
        }
    }
}

impl CapscanConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, CapabilityError> {
        toml::from_str(content).map_err(|e| CapabilityError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CapabilityError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CapabilityError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Result<Self, CapabilityError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `CAPSCAN_*` variables that are set.
    pub fn apply_env(&mut self) -> Result<(), CapabilityError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars<F>(&mut self, lookup: F) -> Result<(), CapabilityError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| -> Result<Option<u64>, CapabilityError> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| CapabilityError::Config(format!("{} must be an integer, got '{}'", name, raw))),
                None => Ok(None),
            }
        };

        if let Some(v) = read("CAPSCAN_MAX_NODES")? {
            self.walk.max_nodes = v as usize;
        }
        if let Some(v) = read("CAPSCAN_MAX_DEPTH")? {
            self.walk.max_depth = v as usize;
        }
        if let Some(v) = read("CAPSCAN_EVALUATE_TOP_N")? {
            self.scan.evaluate_top_n = v as usize;
        }
        if let Some(v) = read("CAPSCAN_SETTLE_TIMEOUT_MS")? {
            self.invoke.settle_timeout_ms = v;
        }
        if let Some(v) = read("CAPSCAN_UPLOAD_DEADLINE_MS")? {
            self.upload_poll.deadline_ms = v;
        }
        if let Some(v) = read("CAPSCAN_MESSAGE_DEADLINE_MS")? {
            self.message_poll.deadline_ms = v;
        }
        if let Some(dir) = lookup("CAPSCAN_CACHE_DIR") {
            self.dispatch.cache_dir = PathBuf::from(dir);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CapscanConfig::from_toml_str(
            r#"
[walk]
max_depth = 2

[upload_poll]
deadline_ms = 900
"#,
        )
        .unwrap();
        assert_eq!(config.walk.max_depth, 2);
        assert_eq!(config.walk.max_nodes, 4000);
        assert_eq!(config.upload_poll.deadline_ms, 900);
        assert_eq!(config.upload_poll.interval_ms, 100);
        assert_eq!(config.scan, ScanConfig::default());
    }

    #[test]
    fn test_message_poll_default_survives_partial_file() {
        let config = CapscanConfig::from_toml_str("[walk]\nmax_depth = 3").unwrap();
        assert_eq!(config.message_poll, PollConfig::new(120, 4500));
        assert_eq!(config.upload_poll, PollConfig::new(100, 1800));
        assert_eq!(config.dispatch, DispatchConfig::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = CapscanConfig::from_toml_str("walk = 3").unwrap_err();
        assert!(matches!(err, CapabilityError::Config(_)));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("CAPSCAN_MAX_NODES", "64"),
            ("CAPSCAN_CACHE_DIR", "/tmp/elsewhere"),
        ]
        .into_iter()
        .collect();
        let mut config = CapscanConfig::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.walk.max_nodes, 64);
        assert_eq!(config.dispatch.cache_dir, PathBuf::from("/tmp/elsewhere"));
        assert_eq!(config.message_poll.deadline_ms, 4500);

        let bad: HashMap<&str, &str> = [("CAPSCAN_MAX_DEPTH", "deep")].into_iter().collect();
        assert!(config
            .apply_vars(|name| bad.get(name).map(|v| v.to_string()))
            .is_err());
    }
}
