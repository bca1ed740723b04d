//! Error kinds shared by every bus manager operation

use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

use crate::device::InterfaceType;
use crate::identity::DeviceIdentity;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Device identity {0} belongs to a superseded topology snapshot")]
    StaleIdentity(DeviceIdentity),
    #[error("{operation} is not supported for {interface} devices")]
    NotSupported {
        interface: InterfaceType,
        operation: &'static str,
    },
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Buffer too small: {required} entries required, capacity is {capacity}")]
    BufferTooSmall { required: usize, capacity: usize },
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Bus master failed: {0}")]
    BusMasterFailed(String),
    #[error("No free host address left on subnet {network}/{prefix_len}")]
    AddressExhausted { network: Ipv4Addr, prefix_len: u8 },
    #[error("Transport failure: {0}")]
    Generic(String),
}

impl BusError {
    /// Shorthand for a capability-table rejection
    pub fn not_supported(interface: InterfaceType, operation: &'static str) -> Self {
        Self::NotSupported {
            interface,
            operation,
        }
    }

    /// Whether the caller may reasonably retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        Self::Generic(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
