//! Discovery and provisioning settings

use anyhow::Result;
use cambus_gige::GVCP_PORT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port devices listen on
    #[serde(default = "default_gvcp_port")]
    pub gvcp_port: u16,
    /// How long to collect discovery replies per adapter
    #[serde(default = "default_window_ms")]
    pub discovery_window_ms: u64,
    /// How long to wait for a FORCEIP acknowledge
    #[serde(default = "default_force_ip_timeout_ms")]
    pub force_ip_timeout_ms: u64,
    /// How long to wait for a register read reply
    #[serde(default = "default_register_timeout_ms")]
    pub register_timeout_ms: u64,
    /// Treat hosts in the ARP neighbour table as occupied when auto-assigning
    #[serde(default = "default_true")]
    pub consult_arp_table: bool,
    /// Adapter name prefixes never used for discovery
    #[serde(default = "default_ignored_interfaces")]
    pub ignored_interfaces: Vec<String>,
}

fn default_gvcp_port() -> u16 {
    GVCP_PORT
}

fn default_window_ms() -> u64 {
    1000
}

fn default_force_ip_timeout_ms() -> u64 {
    1000
}

fn default_register_timeout_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_ignored_interfaces() -> Vec<String> {
    ["lo", "docker", "br-", "veth"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            gvcp_port: default_gvcp_port(),
            discovery_window_ms: default_window_ms(),
            force_ip_timeout_ms: default_force_ip_timeout_ms(),
            register_timeout_ms: default_register_timeout_ms(),
            consult_arp_table: true,
            ignored_interfaces: default_ignored_interfaces(),
        }
    }
}

impl DiscoveryConfig {
    /// Read settings from a TOML file, or defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Discovery configuration not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded discovery configuration");
        Ok(config)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn force_ip_timeout(&self) -> Duration {
        Duration::from_millis(self.force_ip_timeout_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn is_ignored(&self, interface: &str) -> bool {
        self.ignored_interfaces
            .iter()
            .any(|prefix| interface.starts_with(prefix.as_str()))
    }
}
