//! Device types reported by transports and returned to callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::identity::DeviceIdentity;
use crate::net::{IpConfig, MacAddress};

/// Stable hardware address as reported by the transport driver
/// (EUI-64 on the serial bus, a packed port path on USB, the MAC on GigE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HardwareId(pub u64);

impl std::fmt::Display for HardwareId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Transport family a device is attached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    /// IEEE 1394 style serial bus behind a host controller
    SerialBus,
    /// USB-class port behind an xHCI controller or hub
    Usb,
    /// Ethernet-attached (GigE Vision) device
    Network,
}

/// What a given interface family allows callers to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Paged phy registers addressed by page/port/address
    pub phy_registers: bool,
    /// Link info and port status words of the upstream port
    pub port_registers: bool,
    /// Logical bus reset scoped to the device's segment
    pub bus_reset: bool,
    /// Devices carry an IP configuration and may be looked up by address
    pub ip_addressing: bool,
}

impl InterfaceType {
    pub const ALL: [InterfaceType; 3] = [Self::SerialBus, Self::Usb, Self::Network];

    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::SerialBus => Capabilities {
                phy_registers: true,
                port_registers: false,
                bus_reset: true,
                ip_addressing: false,
            },
            Self::Usb => Capabilities {
                phy_registers: false,
                port_registers: true,
                bus_reset: true,
                ip_addressing: false,
            },
            Self::Network => Capabilities {
                phy_registers: false,
                port_registers: false,
                bus_reset: false,
                ip_addressing: true,
            },
        }
    }
}

impl std::fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SerialBus => "serial-bus",
            Self::Usb => "usb",
            Self::Network => "network",
        };
        f.write_str(name)
    }
}

/// Role of a node in the physical hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// The host PC; only ever the tree root
    Host,
    /// Host controller or network adapter
    Controller,
    Hub,
    Camera,
    /// Any other device on the bus
    Device,
}

/// One device as reported by a transport enumeration, in port order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub hardware_id: HardwareId,
    pub kind: NodeKind,
    pub interface: InterfaceType,
    /// Upstream controller or hub; `None` attaches directly to the host
    pub parent: Option<HardwareId>,
    /// Port on the parent the device is plugged into
    pub port: Option<u8>,
    /// Camera serial number (cameras only)
    pub serial_number: Option<u32>,
    pub mac: Option<MacAddress>,
    pub ip: Option<Ipv4Addr>,
}

impl DeviceDescriptor {
    pub fn new(hardware_id: HardwareId, kind: NodeKind, interface: InterfaceType) -> Self {
        Self {
            hardware_id,
            kind,
            interface,
            parent: None,
            port: None,
            serial_number: None,
            mac: None,
            ip: None,
        }
    }

    /// A camera with the given serial number
    pub fn camera(hardware_id: u64, interface: InterfaceType, serial_number: u32) -> Self {
        let mut device = Self::new(HardwareId(hardware_id), NodeKind::Camera, interface);
        device.serial_number = Some(serial_number);
        device
    }

    pub fn controller(hardware_id: u64, interface: InterfaceType) -> Self {
        Self::new(HardwareId(hardware_id), NodeKind::Controller, interface)
    }

    pub fn hub(hardware_id: u64, interface: InterfaceType) -> Self {
        Self::new(HardwareId(hardware_id), NodeKind::Hub, interface)
    }

    /// Attach below `parent` on the given port
    pub fn under(mut self, parent: u64, port: u8) -> Self {
        self.parent = Some(HardwareId(parent));
        self.port = Some(port);
        self
    }

    pub fn with_network(mut self, mac: MacAddress, ip: Ipv4Addr) -> Self {
        self.mac = Some(mac);
        self.ip = Some(ip);
        self
    }

    pub fn is_camera(&self) -> bool {
        self.kind == NodeKind::Camera
    }
}

/// Snapshot of a camera as seen by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub serial_number: u32,
    pub mac: MacAddress,
    pub ip_config: IpConfig,
    pub interface: InterfaceType,
    pub vendor_name: String,
    pub model_name: String,
    pub firmware_version: String,
    pub user_defined_name: String,
    /// Host adapter the discovery reply arrived on
    pub adapter: Option<String>,
    /// Resolved identity, when the camera is part of the current enumeration
    #[serde(skip)]
    pub identity: Option<DeviceIdentity>,
    pub discovered_at: DateTime<Utc>,
}

impl CameraInfo {
    pub fn new(serial_number: u32, mac: MacAddress, ip_config: IpConfig) -> Self {
        Self {
            serial_number,
            mac,
            ip_config,
            interface: InterfaceType::Network,
            vendor_name: String::new(),
            model_name: String::new(),
            firmware_version: String::new(),
            user_defined_name: String::new(),
            adapter: None,
            identity: None,
            discovered_at: Utc::now(),
        }
    }
}
