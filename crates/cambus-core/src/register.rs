//! Register addressing and the standardized link/port word layouts
//!
//! Register Access returns raw words. The [`LinkInfo`] and [`PortStatus`]
//! wrappers decode them for callers following the xHCI 1.1 layouts
//! (section 5.4.10 Port Link Info, section 5.4.8 Port Status and Control).

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Highest valid phy page selector
pub const PHY_MAX_PAGE: u8 = 7;
/// Highest valid phy port selector
pub const PHY_MAX_PORT: u8 = 15;
/// Highest valid paged phy register address
pub const PHY_MAX_ADDRESS: u8 = 7;
/// Phy registers are 8 bits wide
pub const PHY_VALUE_MASK: u32 = 0xFF;

/// Page/port/address triplet selecting one paged phy register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhyAddress {
    pub page: u8,
    pub port: u8,
    pub address: u8,
}

impl PhyAddress {
    /// Validate raw selectors as passed by callers
    pub fn new(page: u32, port: u32, address: u32) -> Result<Self, BusError> {
        if page > PHY_MAX_PAGE as u32 {
            return Err(BusError::InvalidParameter(format!("phy page {} out of range", page)));
        }
        if port > PHY_MAX_PORT as u32 {
            return Err(BusError::InvalidParameter(format!("phy port {} out of range", port)));
        }
        if address > PHY_MAX_ADDRESS as u32 {
            return Err(BusError::InvalidParameter(format!(
                "phy address {} out of range",
                address
            )));
        }
        Ok(Self {
            page: page as u8,
            port: port as u8,
            address: address as u8,
        })
    }
}

/// Words of the upstream port a USB-class device is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortRegister {
    /// Port link info; read-only
    LinkInfo,
    /// Port status and control
    PortStatus,
}

/// Transport-specific register selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterAddress {
    Phy(PhyAddress),
    Port(PortRegister),
}

impl RegisterAddress {
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::Port(PortRegister::LinkInfo))
    }
}

impl std::fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Phy(a) => write!(f, "phy[page={} port={} addr={}]", a.page, a.port, a.address),
            Self::Port(PortRegister::LinkInfo) => f.write_str("port link info"),
            Self::Port(PortRegister::PortStatus) => f.write_str("port status"),
        }
    }
}

#[inline]
fn field(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1u32 << width) - 1)
}

#[inline]
fn bit(word: u32, n: u32) -> bool {
    word & (1 << n) != 0
}

/// Port link info word
///
/// ```text
/// 15:0  link error count
/// 19:16 receive lane count
/// 23:20 transmit lane count
/// 31:24 reserved, reads as zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkInfo(pub u32);

impl LinkInfo {
    pub fn link_error_count(&self) -> u16 {
        field(self.0, 0, 16) as u16
    }

    pub fn rx_lane_count(&self) -> u8 {
        field(self.0, 16, 4) as u8
    }

    pub fn tx_lane_count(&self) -> u8 {
        field(self.0, 20, 4) as u8
    }

    pub fn reserved(&self) -> u8 {
        field(self.0, 24, 8) as u8
    }
}

/// Port indicator control (bits 15:14)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorColor {
    Off,
    Amber,
    Green,
    Undefined,
}

/// Port status and control word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortStatus(pub u32);

impl PortStatus {
    pub const CONNECT_STATUS: u32 = 1 << 0;
    pub const ENABLED: u32 = 1 << 1;
    pub const OVER_CURRENT: u32 = 1 << 3;
    pub const RESET: u32 = 1 << 4;
    pub const LINK_STATE_SHIFT: u32 = 5;
    pub const POWER: u32 = 1 << 9;
    pub const SPEED_SHIFT: u32 = 10;
    pub const INDICATOR_SHIFT: u32 = 14;
    pub const LINK_STATE_WRITE_STROBE: u32 = 1 << 16;
    pub const CONNECT_CHANGE: u32 = 1 << 17;
    pub const ENABLED_CHANGE: u32 = 1 << 18;
    pub const WARM_RESET_CHANGE: u32 = 1 << 19;
    pub const OVER_CURRENT_CHANGE: u32 = 1 << 20;
    pub const RESET_CHANGE: u32 = 1 << 21;
    pub const LINK_STATE_CHANGE: u32 = 1 << 22;
    pub const CONFIG_ERROR_CHANGE: u32 = 1 << 23;
    pub const COLD_ATTACH: u32 = 1 << 24;
    pub const WAKE_ON_CONNECT: u32 = 1 << 25;
    pub const WAKE_ON_DISCONNECT: u32 = 1 << 26;
    pub const WAKE_ON_OVER_CURRENT: u32 = 1 << 27;
    pub const DEVICE_REMOVABLE: u32 = 1 << 30;
    pub const WARM_RESET: u32 = 1 << 31;
    /// Bits 2 and 29:28
    pub const RESERVED_MASK: u32 = (1 << 2) | (0b11 << 28);
    /// All seven change flags, bits 23:17
    pub const CHANGE_MASK: u32 = 0x7F << 17;

    pub fn connected(&self) -> bool {
        bit(self.0, 0)
    }

    pub fn enabled(&self) -> bool {
        bit(self.0, 1)
    }

    pub fn over_current(&self) -> bool {
        bit(self.0, 3)
    }

    pub fn reset_asserted(&self) -> bool {
        bit(self.0, 4)
    }

    /// Raw port link state (bits 8:5)
    pub fn link_state(&self) -> u8 {
        field(self.0, Self::LINK_STATE_SHIFT, 4) as u8
    }

    pub fn powered(&self) -> bool {
        bit(self.0, 9)
    }

    /// Protocol speed id (bits 13:10); 0 means undefined
    pub fn speed_id(&self) -> Option<u8> {
        match field(self.0, Self::SPEED_SHIFT, 4) as u8 {
            0 => None,
            id => Some(id),
        }
    }

    pub fn indicator(&self) -> IndicatorColor {
        match field(self.0, Self::INDICATOR_SHIFT, 2) {
            0 => IndicatorColor::Off,
            1 => IndicatorColor::Amber,
            2 => IndicatorColor::Green,
            _ => IndicatorColor::Undefined,
        }
    }

    pub fn link_state_write_strobe(&self) -> bool {
        bit(self.0, 16)
    }

    pub fn connect_changed(&self) -> bool {
        bit(self.0, 17)
    }

    pub fn enabled_changed(&self) -> bool {
        bit(self.0, 18)
    }

    pub fn warm_reset_changed(&self) -> bool {
        bit(self.0, 19)
    }

    pub fn over_current_changed(&self) -> bool {
        bit(self.0, 20)
    }

    pub fn reset_changed(&self) -> bool {
        bit(self.0, 21)
    }

    pub fn link_state_changed(&self) -> bool {
        bit(self.0, 22)
    }

    pub fn config_error_changed(&self) -> bool {
        bit(self.0, 23)
    }

    /// Change flags (bits 23:17) shifted down to bit 0
    pub fn change_flags(&self) -> u8 {
        field(self.0, 17, 7) as u8
    }

    pub fn cold_attach(&self) -> bool {
        bit(self.0, 24)
    }

    pub fn wake_on_connect(&self) -> bool {
        bit(self.0, 25)
    }

    pub fn wake_on_disconnect(&self) -> bool {
        bit(self.0, 26)
    }

    pub fn wake_on_over_current(&self) -> bool {
        bit(self.0, 27)
    }

    /// Bit 30 set means the attached device is non-removable
    pub fn device_removable(&self) -> bool {
        !bit(self.0, 30)
    }

    /// Bit 31 always reads as zero
    pub fn warm_reset_requested(&self) -> bool {
        bit(self.0, 31)
    }

    /// The word as hardware would present it on read
    pub fn as_read(&self) -> PortStatus {
        PortStatus(self.0 & !(Self::WARM_RESET | Self::RESERVED_MASK))
    }
}
