//! Manager configuration loading

use anyhow::Result;
use cambus_discovery::DiscoveryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Pending bus events before publishers wait for the dispatcher
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Bound on a single register read or write
    #[serde(default = "default_register_timeout_ms")]
    pub register_timeout_ms: u64,
    /// Bound on one full bus enumeration
    #[serde(default = "default_enumerate_timeout_ms")]
    pub enumerate_timeout_ms: u64,
    /// Bound on issuing a bus reset
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Rescan when the transport reports hot-plug activity
    #[serde(default = "default_true")]
    pub watch_hotplug: bool,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_register_timeout_ms() -> u64 {
    500
}

fn default_enumerate_timeout_ms() -> u64 {
    5000
}

fn default_reset_timeout_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: default_event_queue_capacity(),
            register_timeout_ms: default_register_timeout_ms(),
            enumerate_timeout_ms: default_enumerate_timeout_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
            watch_hotplug: true,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Same as [`load_config`]
    pub fn load(path: &Path) -> Result<Self> {
        load_config(path)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn enumerate_timeout(&self) -> Duration {
        Duration::from_millis(self.enumerate_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Load configuration from file, or use defaults when it does not exist
pub fn load_config(path: &Path) -> Result<ManagerConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(ManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("cambus.toml")).unwrap();
        assert_eq!(config, ManagerConfig::default());
        let config = ManagerConfig::load(&dir.path().join("cambus.toml")).unwrap();
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn test_nested_discovery_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
register_timeout_ms = 50

[discovery]
consult_arp_table = false
discovery_window_ms = 200
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.register_timeout(), Duration::from_millis(50));
        assert_eq!(config.event_queue_capacity, 256);
        assert!(!config.discovery.consult_arp_table);
        assert_eq!(config.discovery.discovery_window_ms, 200);
        assert_eq!(config.discovery.gvcp_port, 3956);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "event_queue_capacity = \"lots\"").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
