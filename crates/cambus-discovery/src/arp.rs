//! ARP neighbour table, used to avoid handing out addresses already in use

use anyhow::Result;
use std::net::Ipv4Addr;
use std::process::Command;
use std::str::FromStr;
use tracing::debug;

/// ARP table entry
#[derive(Debug, Clone)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub interface: String,
    pub state: ArpState,
}

/// ARP entry state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    Incomplete,
    Permanent,
    Unknown,
}

impl ArpState {
    /// Whether some host answered for this address at some point
    pub fn is_claimed(&self) -> bool {
        !matches!(self, Self::Failed | Self::Incomplete)
    }
}

/// Get current ARP table entries via `ip neigh`
pub fn get_arp_table() -> Result<Vec<ArpEntry>> {
    let output = Command::new("ip").args(["-4", "neigh", "show"]).output()?;

    if !output.status.success() {
        anyhow::bail!(
            "Failed to read neighbour table: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let entries: Vec<ArpEntry> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_ip_neigh_line)
        .collect();

    debug!("Found {} ARP entries", entries.len());
    Ok(entries)
}

/// Addresses some neighbour has claimed on `interface`
pub fn claimed_addresses(entries: &[ArpEntry], interface: &str) -> Vec<Ipv4Addr> {
    entries
        .iter()
        .filter(|e| e.interface == interface && e.state.is_claimed())
        .map(|e| e.ip)
        .collect()
}

/// Parse one line of `ip neigh show`:
/// `192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`
fn parse_ip_neigh_line(line: &str) -> Option<ArpEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }

    let ip = Ipv4Addr::from_str(parts[0]).ok()?;
    let dev_idx = parts.iter().position(|&p| p == "dev")?;
    let interface = parts.get(dev_idx + 1)?.to_string();

    // INCOMPLETE and FAILED entries carry no lladdr
    let mac = parts
        .iter()
        .position(|&p| p == "lladdr")
        .and_then(|idx| parts.get(idx + 1))
        .map(|s| s.to_string())
        .unwrap_or_default();

    let state = parts
        .last()
        .map(|s| parse_arp_state(s))
        .unwrap_or(ArpState::Unknown);

    Some(ArpEntry {
        ip,
        mac,
        interface,
        state,
    })
}

fn parse_arp_state(s: &str) -> ArpState {
    match s.to_uppercase().as_str() {
        "REACHABLE" => ArpState::Reachable,
        "STALE" => ArpState::Stale,
        "DELAY" => ArpState::Delay,
        "PROBE" => ArpState::Probe,
        "FAILED" => ArpState::Failed,
        "INCOMPLETE" => ArpState::Incomplete,
        "PERMANENT" => ArpState::Permanent,
        _ => ArpState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reachable_line() {
        let entry =
            parse_ip_neigh_line("192.168.1.100 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE")
                .unwrap();
        assert_eq!(entry.ip, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(entry.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(entry.interface, "eth0");
        assert_eq!(entry.state, ArpState::Reachable);
    }

    #[test]
    fn test_parse_incomplete_line() {
        let entry = parse_ip_neigh_line("192.168.1.100 dev eth0 INCOMPLETE").unwrap();
        assert_eq!(entry.mac, "");
        assert_eq!(entry.state, ArpState::Incomplete);
        assert!(parse_ip_neigh_line("192.168.1.100 dev").is_none());
    }

    #[test]
    fn test_claimed_addresses_filters_interface_and_state() {
        let entries: Vec<ArpEntry> = [
            "10.0.0.5 dev gige0 lladdr 00:b0:9d:00:00:05 STALE",
            "10.0.0.6 dev gige0 FAILED",
            "10.0.0.7 dev eth9 lladdr 00:b0:9d:00:00:07 REACHABLE",
        ]
        .iter()
        .filter_map(|l| parse_ip_neigh_line(l))
        .collect();
        assert_eq!(
            claimed_addresses(&entries, "gige0"),
            vec![Ipv4Addr::new(10, 0, 0, 5)]
        );
    }
}
