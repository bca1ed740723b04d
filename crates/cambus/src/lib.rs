//! cambus - bus and device manager for cameras on serial bus, USB and GigE
//!
//! A [`BusManager`] enumerates every attached bus through a [`BusDriver`],
//! hands out opaque [`DeviceIdentity`] tokens, keeps the physical topology
//! as an immutable tree, delivers arrival/removal/reset events to
//! subscribers and gives raw access to phy and port registers. GigE
//! discovery and IP provisioning come from `cambus-discovery`.

pub mod config;
mod control;
pub mod events;
mod manager;
mod registers;
pub mod resolver;

pub use cambus_core::{
    BusDriver, BusError, CameraInfo, DeviceDescriptor, DeviceIdentity, HardwareId,
    InterfaceType, IpConfig, LinkInfo, MacAddress, PortStatus, RegisterAddress, Result,
    SimulatedBus, TopologyNode,
};
pub use cambus_discovery::{AssignmentReport, GigeNetwork, IpAssignment};
pub use config::{load_config, ManagerConfig};
pub use events::{BusEvent, BusEventKind, CallbackHandle, EventCenter};
pub use manager::BusManager;
pub use resolver::Snapshot;
