//! Host adapter detection

use anyhow::Result;
use cambus_core::HostAdapter;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;

/// IPv4 adapters usable for discovery, with their default gateways when known
pub fn detect_adapters(config: &DiscoveryConfig) -> Result<Vec<HostAdapter>> {
    let gateways = default_gateways().unwrap_or_else(|e| {
        debug!(error = %e, "Default routes unavailable, adapters get no gateway");
        HashMap::new()
    });

    let adapters: Vec<HostAdapter> = NetworkInterface::show()?
        .into_iter()
        .filter(|iface| !config.is_ignored(&iface.name))
        .filter_map(|iface| {
            iface.addr.iter().find_map(|addr| match addr {
                Addr::V4(v4) if !v4.ip.is_loopback() => {
                    let mut adapter = usable_adapter(&iface.name, v4.ip, v4.netmask)?;
                    adapter.gateway = gateways.get(&iface.name).copied();
                    Some(adapter)
                }
                _ => None,
            })
        })
        .collect();

    info!(count = adapters.len(), "Detected host adapters");
    Ok(adapters)
}

/// Adapters without a known netmask are skipped, since guessing one would
/// let auto-assignment hand out addresses outside the real subnet
fn usable_adapter(name: &str, ip: Ipv4Addr, netmask: Option<Ipv4Addr>) -> Option<HostAdapter> {
    match netmask {
        Some(netmask) => Some(HostAdapter::new(name, ip, netmask)),
        None => {
            warn!(adapter = name, ip = %ip, "Interface reports no netmask, skipping");
            None
        }
    }
}

/// Default gateway per interface from `ip -4 route show default`
pub fn default_gateways() -> Result<HashMap<String, Ipv4Addr>> {
    let output = Command::new("ip")
        .args(["-4", "route", "show", "default"])
        .output()?;

    if !output.status.success() {
        anyhow::bail!(
            "Failed to read routing table: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_default_route_line)
        .collect())
}

/// Parse `default via 192.168.1.1 dev eth0 proto dhcp metric 100`
fn parse_default_route_line(line: &str) -> Option<(String, Ipv4Addr)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.first() != Some(&"default") {
        return None;
    }
    let via = parts.iter().position(|&p| p == "via")?;
    let dev = parts.iter().position(|&p| p == "dev")?;
    let gateway = parts.get(via + 1)?.parse().ok()?;
    Some((parts.get(dev + 1)?.to_string(), gateway))
}
