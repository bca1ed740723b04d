//! cambus Core - Core types, register layouts, and topology for the bus manager
//!
//! This crate provides the foundational types shared by every cambus crate:
//! - Opaque device identities backed by a generational arena
//! - Interface families and their capability table
//! - MAC/IPv4 value types, host adapters, and subnet math
//! - Bit-exact register layouts for link info and port status words
//! - The immutable topology tree rebuilt on every bus change
//! - The `BusDriver` boundary to physical transports, plus a simulated bus

pub mod device;
pub mod driver;
pub mod error;
pub mod identity;
pub mod net;
pub mod register;
pub mod sim;
pub mod topology;

pub use device::{CameraInfo, Capabilities, DeviceDescriptor, HardwareId, InterfaceType, NodeKind};
pub use driver::{BusDriver, HotplugNotice};
pub use error::{BusError, Result};
pub use identity::{DeviceIdentity, IdentityArena};
pub use net::{HostAdapter, IpConfig, MacAddress};
pub use register::{
    IndicatorColor, LinkInfo, PhyAddress, PortRegister, PortStatus, RegisterAddress,
};
pub use sim::SimulatedBus;
pub use topology::TopologyNode;
