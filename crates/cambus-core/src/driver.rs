//! Boundary with the physical transport drivers
//!
//! The bus manager never moves bytes itself. Everything it needs from the
//! hardware goes through [`BusDriver`]. Calls are synchronous and may block
//! for as long as the transport takes; the manager runs them on the blocking
//! pool and bounds them with its own timeouts.

use tokio::sync::mpsc;

use crate::device::{DeviceDescriptor, HardwareId};
use crate::error::Result;
use crate::register::RegisterAddress;

/// Unsolicited notice from a transport that the bus may have changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugNotice {
    Attached,
    Detached,
    /// The transport observed a reset it did not originate from us
    Reset,
}

pub trait BusDriver: Send + Sync + 'static {
    /// Every device on every bus, in discovery/port order
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    fn read_register(&self, device: HardwareId, address: RegisterAddress) -> Result<u32>;

    fn write_register(&self, device: HardwareId, address: RegisterAddress, value: u32)
        -> Result<()>;

    /// Issue a reset on the bus segment containing `device`
    fn fire_reset(&self, device: HardwareId) -> Result<()>;

    /// Hand out the hot-plug notice stream; drivers that cannot watch the
    /// bus return `None`. Only the first call may succeed.
    fn take_hotplug(&self) -> Option<mpsc::UnboundedReceiver<HotplugNotice>> {
        None
    }
}
