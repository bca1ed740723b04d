//! MAC/IPv4 value types, host adapters, and subnet math

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::BusError;

/// 48-bit Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Build from the split representation used on the wire (16-bit high, 32-bit low)
    pub fn from_parts(high: u16, low: u32) -> Self {
        let h = high.to_be_bytes();
        let l = low.to_be_bytes();
        Self([h[0], h[1], l[0], l[1], l[2], l[3]])
    }

    pub fn high(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    pub fn low(&self) -> u32 {
        u32::from_be_bytes([self.0[2], self.0[3], self.0[4], self.0[5]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = BusError;

    /// Accepts `aa:bb:cc:dd:ee:ff` and `aa-bb-cc-dd-ee-ff`, any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BusError::InvalidParameter(format!("malformed MAC address '{}'", s));
        let parts: Vec<&str> = s.split(|c: char| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

impl TryFrom<String> for MacAddress {
    type Error = BusError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// IPv4 configuration of a network device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl IpConfig {
    pub fn new(address: Ipv4Addr, subnet_mask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self {
            address,
            subnet_mask,
            gateway,
        }
    }

    /// Reject configurations no device could adopt
    pub fn validate(&self) -> Result<(), BusError> {
        if !is_contiguous_mask(self.subnet_mask) || self.subnet_mask.is_unspecified() {
            return Err(BusError::InvalidParameter(format!(
                "subnet mask {} is not a contiguous prefix",
                self.subnet_mask
            )));
        }
        let prefix_len = mask_to_prefix(self.subnet_mask);
        if self.address.is_unspecified()
            || self.address.is_broadcast()
            || self.address.is_multicast()
            || self.address.is_loopback()
        {
            return Err(BusError::InvalidParameter(format!(
                "{} is not a usable host address",
                self.address
            )));
        }
        if prefix_len < 31 {
            let host = u32::from(self.address) & !u32::from(self.subnet_mask);
            if host == 0 || host == !u32::from(self.subnet_mask) {
                return Err(BusError::InvalidParameter(format!(
                    "{} is the network or broadcast address of its subnet",
                    self.address
                )));
            }
        }
        Ok(())
    }
}

/// A host network adapter a device can be reached through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAdapter {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

impl HostAdapter {
    pub fn new(name: &str, address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            name: name.to_string(),
            address,
            netmask,
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn prefix_len(&self) -> u8 {
        mask_to_prefix(self.netmask)
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & u32::from(self.netmask))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !u32::from(self.netmask))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        is_in_subnet(ip, self.network(), self.prefix_len())
    }

    /// Whether a device configured this way can be reached without routing
    pub fn shares_subnet(&self, config: &IpConfig) -> bool {
        self.contains(config.address)
    }

    /// Host addresses between the network and broadcast addresses, lowest first
    pub fn host_range(&self) -> impl Iterator<Item = Ipv4Addr> {
        let network = u32::from(self.network());
        let broadcast = u32::from(self.broadcast());
        let (first, last) = if broadcast > network + 1 {
            (network + 1, broadcast - 1)
        } else {
            (1, 0)
        };
        (first..=last).map(Ipv4Addr::from)
    }
}

/// Check if IP is in subnet
pub fn is_in_subnet(ip: Ipv4Addr, subnet: Ipv4Addr, prefix_len: u8) -> bool {
    let mask = u32::from(prefix_to_mask(prefix_len));
    (u32::from(ip) & mask) == (u32::from(subnet) & mask)
}

pub fn prefix_to_mask(prefix_len: u8) -> Ipv4Addr {
    let mask = if prefix_len >= 32 {
        0xFFFF_FFFF
    } else if prefix_len == 0 {
        0
    } else {
        !((1u32 << (32 - prefix_len)) - 1)
    };
    Ipv4Addr::from(mask)
}

pub fn mask_to_prefix(mask: Ipv4Addr) -> u8 {
    u32::from(mask).count_ones() as u8
}

/// A netmask is valid only if its set bits form a single leading run
pub fn is_contiguous_mask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}
