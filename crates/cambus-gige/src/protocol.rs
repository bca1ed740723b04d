//! GVCP (GigE Vision Control Protocol) message encoding
//!
//! Only the messages the bus manager needs are covered: discovery, forced
//! IP assignment and single-register reads. All fields are big-endian.
//!
//! ```text
//! command header: key(8)=0x42 | flags(8) | command(16) | length(16) | req_id(16)
//! ack header:     status(16)  | answer(16)            | length(16) | ack_id(16)
//! ```

use cambus_core::{BusError, CameraInfo, IpConfig, MacAddress};
use std::net::Ipv4Addr;
use thiserror::Error;

/// UDP port devices listen on for control traffic
pub const GVCP_PORT: u16 = 3956;

pub const GVCP_KEY: u8 = 0x42;
pub const HEADER_LEN: usize = 8;

pub const FLAG_ACK_REQUIRED: u8 = 0x01;
/// Discovery only: ask the device to broadcast its ack, needed when the
/// device sits on a different subnet than the host
pub const FLAG_BROADCAST_ACK: u8 = 0x10;

pub const DISCOVERY_CMD: u16 = 0x0002;
pub const DISCOVERY_ACK: u16 = 0x0003;
pub const FORCEIP_CMD: u16 = 0x0004;
pub const FORCEIP_ACK: u16 = 0x0005;
pub const READREG_CMD: u16 = 0x0080;
pub const READREG_ACK: u16 = 0x0081;

pub const DISCOVERY_ACK_LEN: usize = 248;
pub const FORCEIP_CMD_LEN: usize = 56;

/// Control Channel Privilege bootstrap register
pub const CCP_REGISTER: u32 = 0x0A00;
pub const CCP_EXCLUSIVE_ACCESS: u32 = 0x1;
pub const CCP_CONTROL_ACCESS: u32 = 0x2;

pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const NOT_IMPLEMENTED: u16 = 0x8001;
    pub const INVALID_PARAMETER: u16 = 0x8002;
    pub const INVALID_ADDRESS: u16 = 0x8003;
    pub const ACCESS_DENIED: u16 = 0x8006;
    pub const BUSY: u16 = 0x8007;
}

// DISCOVERY_ACK payload offsets
mod discovery {
    pub const SPEC_MAJOR: usize = 0;
    pub const SPEC_MINOR: usize = 2;
    pub const DEVICE_MODE: usize = 4;
    pub const MAC_HIGH: usize = 10;
    pub const MAC_LOW: usize = 12;
    pub const IP_OPTIONS: usize = 16;
    pub const IP_CURRENT: usize = 20;
    pub const CURRENT_IP: usize = 36;
    pub const SUBNET_MASK: usize = 52;
    pub const GATEWAY: usize = 68;
    pub const MANUFACTURER: (usize, usize) = (72, 32);
    pub const MODEL: (usize, usize) = (104, 32);
    pub const DEVICE_VERSION: (usize, usize) = (136, 32);
    pub const MANUFACTURER_INFO: (usize, usize) = (168, 48);
    pub const SERIAL_NUMBER: (usize, usize) = (216, 16);
    pub const USER_NAME: (usize, usize) = (232, 16);
}

// FORCEIP_CMD payload offsets
mod forceip {
    pub const MAC_HIGH: usize = 2;
    pub const MAC_LOW: usize = 4;
    pub const STATIC_IP: usize = 20;
    pub const SUBNET_MASK: usize = 36;
    pub const GATEWAY: usize = 52;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Packet truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Bad command key 0x{0:02x}")]
    BadKey(u8),
    #[error("Unexpected message 0x{actual:04x}, expected 0x{expected:04x}")]
    UnexpectedMessage { expected: u16, actual: u16 },
    #[error("Device returned status 0x{0:04x}")]
    Status(u16),
    #[error("Ack id {actual} does not match request {expected}")]
    AckIdMismatch { expected: u16, actual: u16 },
    #[error("Serial number field '{0}' is not numeric")]
    BadSerial(String),
}

impl From<ProtocolError> for BusError {
    fn from(err: ProtocolError) -> Self {
        BusError::Generic(err.to_string())
    }
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn get_ip(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::from(get_u32(buf, at))
}

fn put_ip(buf: &mut [u8], at: usize, ip: Ipv4Addr) {
    put_u32(buf, at, u32::from(ip));
}

/// NUL-padded ASCII field
fn get_str(buf: &[u8], (at, len): (usize, usize)) -> String {
    let raw = &buf[at..at + len];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

fn put_str(buf: &mut [u8], (at, len): (usize, usize), s: &str) {
    let bytes = s.as_bytes();
    // Always leave room for a terminating NUL
    let n = bytes.len().min(len - 1);
    buf[at..at + n].copy_from_slice(&bytes[..n]);
}

fn ensure_len(packet: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if packet.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            actual: packet.len(),
        });
    }
    Ok(())
}

/// Header of a host-to-device command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub flags: u8,
    pub command: u16,
    pub length: u16,
    pub req_id: u16,
}

impl CommandHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = GVCP_KEY;
        header[1] = self.flags;
        put_u16(&mut header, 2, self.command);
        put_u16(&mut header, 4, self.length);
        put_u16(&mut header, 6, self.req_id);
        header
    }

    pub fn decode(packet: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(packet, HEADER_LEN)?;
        if packet[0] != GVCP_KEY {
            return Err(ProtocolError::BadKey(packet[0]));
        }
        Ok(Self {
            flags: packet[1],
            command: get_u16(packet, 2),
            length: get_u16(packet, 4),
            req_id: get_u16(packet, 6),
        })
    }

    pub fn ack_required(&self) -> bool {
        self.flags & FLAG_ACK_REQUIRED != 0
    }
}

/// Header of a device-to-host acknowledge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeader {
    pub status: u16,
    pub answer: u16,
    pub length: u16,
    pub ack_id: u16,
}

impl AckHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        put_u16(&mut header, 0, self.status);
        put_u16(&mut header, 2, self.answer);
        put_u16(&mut header, 4, self.length);
        put_u16(&mut header, 6, self.ack_id);
        header
    }

    pub fn decode(packet: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(packet, HEADER_LEN)?;
        Ok(Self {
            status: get_u16(packet, 0),
            answer: get_u16(packet, 2),
            length: get_u16(packet, 4),
            ack_id: get_u16(packet, 6),
        })
    }

    /// Check answer code and status, then that the declared payload is present
    pub fn expect(packet: &[u8], answer: u16) -> Result<Self, ProtocolError> {
        let header = Self::decode(packet)?;
        if header.answer != answer {
            return Err(ProtocolError::UnexpectedMessage {
                expected: answer,
                actual: header.answer,
            });
        }
        if header.status != status::SUCCESS {
            return Err(ProtocolError::Status(header.status));
        }
        ensure_len(packet, HEADER_LEN + header.length as usize)?;
        Ok(header)
    }
}

/// Broadcast discovery request
pub fn discovery_cmd(req_id: u16) -> Vec<u8> {
    CommandHeader {
        flags: FLAG_ACK_REQUIRED | FLAG_BROADCAST_ACK,
        command: DISCOVERY_CMD,
        length: 0,
        req_id,
    }
    .encode()
    .to_vec()
}

/// Payload of DISCOVERY_ACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryAck {
    pub spec_major: u16,
    pub spec_minor: u16,
    pub device_mode: u32,
    pub mac: MacAddress,
    pub ip_config_options: u32,
    pub ip_config_current: u32,
    pub ip: IpConfig,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub manufacturer_info: String,
    pub serial_number: String,
    pub user_defined_name: String,
}

impl DiscoveryAck {
    pub fn new(mac: MacAddress, ip: IpConfig, serial_number: u32) -> Self {
        Self {
            spec_major: 2,
            spec_minor: 0,
            device_mode: 0x8000_0000,
            mac,
            ip_config_options: 0x8000_0007,
            ip_config_current: 0x0000_0005,
            ip,
            manufacturer: String::new(),
            model: String::new(),
            device_version: String::new(),
            manufacturer_info: String::new(),
            serial_number: serial_number.to_string(),
            user_defined_name: String::new(),
        }
    }

    /// Full ack datagram, header included
    pub fn encode(&self, ack_id: u16) -> Vec<u8> {
        let mut packet = vec![0u8; HEADER_LEN + DISCOVERY_ACK_LEN];
        let header = AckHeader {
            status: status::SUCCESS,
            answer: DISCOVERY_ACK,
            length: DISCOVERY_ACK_LEN as u16,
            ack_id,
        };
        packet[..HEADER_LEN].copy_from_slice(&header.encode());

        let p = &mut packet[HEADER_LEN..];
        put_u16(p, discovery::SPEC_MAJOR, self.spec_major);
        put_u16(p, discovery::SPEC_MINOR, self.spec_minor);
        put_u32(p, discovery::DEVICE_MODE, self.device_mode);
        put_u16(p, discovery::MAC_HIGH, self.mac.high());
        put_u32(p, discovery::MAC_LOW, self.mac.low());
        put_u32(p, discovery::IP_OPTIONS, self.ip_config_options);
        put_u32(p, discovery::IP_CURRENT, self.ip_config_current);
        put_ip(p, discovery::CURRENT_IP, self.ip.address);
        put_ip(p, discovery::SUBNET_MASK, self.ip.subnet_mask);
        put_ip(p, discovery::GATEWAY, self.ip.gateway);
        put_str(p, discovery::MANUFACTURER, &self.manufacturer);
        put_str(p, discovery::MODEL, &self.model);
        put_str(p, discovery::DEVICE_VERSION, &self.device_version);
        put_str(p, discovery::MANUFACTURER_INFO, &self.manufacturer_info);
        put_str(p, discovery::SERIAL_NUMBER, &self.serial_number);
        put_str(p, discovery::USER_NAME, &self.user_defined_name);
        packet
    }

    pub fn decode(packet: &[u8]) -> Result<(AckHeader, Self), ProtocolError> {
        let header = AckHeader::expect(packet, DISCOVERY_ACK)?;
        ensure_len(packet, HEADER_LEN + DISCOVERY_ACK_LEN)?;
        let p = &packet[HEADER_LEN..];
        let ack = Self {
            spec_major: get_u16(p, discovery::SPEC_MAJOR),
            spec_minor: get_u16(p, discovery::SPEC_MINOR),
            device_mode: get_u32(p, discovery::DEVICE_MODE),
            mac: MacAddress::from_parts(
                get_u16(p, discovery::MAC_HIGH),
                get_u32(p, discovery::MAC_LOW),
            ),
            ip_config_options: get_u32(p, discovery::IP_OPTIONS),
            ip_config_current: get_u32(p, discovery::IP_CURRENT),
            ip: IpConfig::new(
                get_ip(p, discovery::CURRENT_IP),
                get_ip(p, discovery::SUBNET_MASK),
                get_ip(p, discovery::GATEWAY),
            ),
            manufacturer: get_str(p, discovery::MANUFACTURER),
            model: get_str(p, discovery::MODEL),
            device_version: get_str(p, discovery::DEVICE_VERSION),
            manufacturer_info: get_str(p, discovery::MANUFACTURER_INFO),
            serial_number: get_str(p, discovery::SERIAL_NUMBER),
            user_defined_name: get_str(p, discovery::USER_NAME),
        };
        Ok((header, ack))
    }

    /// Convert to the caller-facing record; the serial must be numeric
    pub fn to_camera_info(&self) -> Result<CameraInfo, ProtocolError> {
        let serial = self
            .serial_number
            .parse::<u32>()
            .map_err(|_| ProtocolError::BadSerial(self.serial_number.clone()))?;
        let mut info = CameraInfo::new(serial, self.mac, self.ip);
        info.vendor_name = self.manufacturer.clone();
        info.model_name = self.model.clone();
        info.firmware_version = self.device_version.clone();
        info.user_defined_name = self.user_defined_name.clone();
        Ok(info)
    }
}

/// FORCEIP_CMD: addressed by MAC, carried in a broadcast datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceIpCommand {
    pub mac: MacAddress,
    pub config: IpConfig,
}

impl ForceIpCommand {
    pub fn encode(&self, req_id: u16, ack_required: bool) -> Vec<u8> {
        let mut packet = vec![0u8; HEADER_LEN + FORCEIP_CMD_LEN];
        let header = CommandHeader {
            flags: if ack_required { FLAG_ACK_REQUIRED } else { 0 },
            command: FORCEIP_CMD,
            length: FORCEIP_CMD_LEN as u16,
            req_id,
        };
        packet[..HEADER_LEN].copy_from_slice(&header.encode());

        let p = &mut packet[HEADER_LEN..];
        put_u16(p, forceip::MAC_HIGH, self.mac.high());
        put_u32(p, forceip::MAC_LOW, self.mac.low());
        put_ip(p, forceip::STATIC_IP, self.config.address);
        put_ip(p, forceip::SUBNET_MASK, self.config.subnet_mask);
        put_ip(p, forceip::GATEWAY, self.config.gateway);
        packet
    }

    pub fn decode(packet: &[u8]) -> Result<(CommandHeader, Self), ProtocolError> {
        let header = CommandHeader::decode(packet)?;
        if header.command != FORCEIP_CMD {
            return Err(ProtocolError::UnexpectedMessage {
                expected: FORCEIP_CMD,
                actual: header.command,
            });
        }
        ensure_len(packet, HEADER_LEN + FORCEIP_CMD_LEN)?;
        let p = &packet[HEADER_LEN..];
        let cmd = Self {
            mac: MacAddress::from_parts(get_u16(p, forceip::MAC_HIGH), get_u32(p, forceip::MAC_LOW)),
            config: IpConfig::new(
                get_ip(p, forceip::STATIC_IP),
                get_ip(p, forceip::SUBNET_MASK),
                get_ip(p, forceip::GATEWAY),
            ),
        };
        Ok((header, cmd))
    }
}

pub fn forceip_ack(ack_id: u16) -> Vec<u8> {
    AckHeader {
        status: status::SUCCESS,
        answer: FORCEIP_ACK,
        length: 0,
        ack_id,
    }
    .encode()
    .to_vec()
}

/// READREG_CMD for a list of 32-bit aligned bootstrap registers
pub fn readreg_cmd(req_id: u16, addresses: &[u32]) -> Vec<u8> {
    let header = CommandHeader {
        flags: FLAG_ACK_REQUIRED,
        command: READREG_CMD,
        length: (addresses.len() * 4) as u16,
        req_id,
    };
    let mut packet = header.encode().to_vec();
    for addr in addresses {
        packet.extend_from_slice(&addr.to_be_bytes());
    }
    packet
}

/// Register addresses of a READREG_CMD
pub fn decode_readreg_cmd(packet: &[u8]) -> Result<(CommandHeader, Vec<u32>), ProtocolError> {
    let header = CommandHeader::decode(packet)?;
    if header.command != READREG_CMD {
        return Err(ProtocolError::UnexpectedMessage {
            expected: READREG_CMD,
            actual: header.command,
        });
    }
    ensure_len(packet, HEADER_LEN + header.length as usize)?;
    let addrs = packet[HEADER_LEN..HEADER_LEN + header.length as usize]
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((header, addrs))
}

pub fn readreg_ack(ack_id: u16, status_code: u16, values: &[u32]) -> Vec<u8> {
    let header = AckHeader {
        status: status_code,
        answer: READREG_ACK,
        length: (values.len() * 4) as u16,
        ack_id,
    };
    let mut packet = header.encode().to_vec();
    for value in values {
        packet.extend_from_slice(&value.to_be_bytes());
    }
    packet
}

/// Register values of a READREG_ACK answering `req_id`
pub fn decode_readreg_ack(packet: &[u8], req_id: u16) -> Result<Vec<u32>, ProtocolError> {
    let header = AckHeader::expect(packet, READREG_ACK)?;
    if header.ack_id != req_id {
        return Err(ProtocolError::AckIdMismatch {
            expected: req_id,
            actual: header.ack_id,
        });
    }
    Ok(packet[HEADER_LEN..HEADER_LEN + header.length as usize]
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ack() -> DiscoveryAck {
        let mac: MacAddress = "00:b0:9d:12:34:56".parse().unwrap();
        let ip = IpConfig::new(
            Ipv4Addr::new(10, 0, 0, 17),
            Ipv4Addr::new(255, 0, 0, 0),
            Ipv4Addr::new(10, 0, 0, 1),
        );
        let mut ack = DiscoveryAck::new(mac, ip, 14_123_456);
        ack.manufacturer = "Point Grey Research".to_string();
        ack.model = "Blackfly BFLY-PGE-13E4C".to_string();
        ack
    }

    #[test]
    fn test_discovery_cmd_header() {
        let packet = discovery_cmd(0x1234);
        assert_eq!(packet, vec![0x42, 0x11, 0x00, 0x02, 0x00, 0x00, 0x12, 0x34]);
    }

    #[test]
    fn test_discovery_ack_layout() {
        let packet = sample_ack().encode(7);
        assert_eq!(packet.len(), 256);
        // ack header: status 0, answer 0x0003, length 248, ack id 7
        assert_eq!(&packet[..8], &[0x00, 0x00, 0x00, 0x03, 0x00, 0xF8, 0x00, 0x07]);
        // MAC high at payload offset 10, low at 12
        assert_eq!(&packet[8 + 10..8 + 16], &[0x00, 0xb0, 0x9d, 0x12, 0x34, 0x56]);
        // current IP at payload offset 36
        assert_eq!(&packet[8 + 36..8 + 40], &[10, 0, 0, 17]);
        assert_eq!(&packet[8 + 52..8 + 56], &[255, 0, 0, 0]);
        assert_eq!(&packet[8 + 68..8 + 72], &[10, 0, 0, 1]);
        assert_eq!(&packet[8 + 216..8 + 224], b"14123456");
    }

    #[test]
    fn test_discovery_ack_decode() {
        let (header, ack) = DiscoveryAck::decode(&sample_ack().encode(9)).unwrap();
        assert_eq!(header.ack_id, 9);
        assert_eq!(ack, sample_ack());
        let info = ack.to_camera_info().unwrap();
        assert_eq!(info.serial_number, 14_123_456);
        assert_eq!(info.model_name, "Blackfly BFLY-PGE-13E4C");
    }

    #[test]
    fn test_truncated_discovery_ack_rejected() {
        let packet = sample_ack().encode(1);
        assert!(matches!(
            DiscoveryAck::decode(&packet[..100]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_non_numeric_serial_rejected() {
        let mut ack = sample_ack();
        ack.serial_number = "ABC-1".to_string();
        assert!(matches!(ack.to_camera_info(), Err(ProtocolError::BadSerial(_))));
    }

    #[test]
    fn test_forceip_layout() {
        let cmd = ForceIpCommand {
            mac: "00:b0:9d:12:34:56".parse().unwrap(),
            config: IpConfig::new(
                Ipv4Addr::new(192, 168, 0, 2),
                Ipv4Addr::new(255, 255, 255, 0),
                Ipv4Addr::new(192, 168, 0, 1),
            ),
        };
        let packet = cmd.encode(3, true);
        assert_eq!(packet.len(), 64);
        assert_eq!(&packet[..8], &[0x42, 0x01, 0x00, 0x04, 0x00, 0x38, 0x00, 0x03]);
        assert_eq!(&packet[8 + 2..8 + 8], &[0x00, 0xb0, 0x9d, 0x12, 0x34, 0x56]);
        assert_eq!(&packet[8 + 20..8 + 24], &[192, 168, 0, 2]);
        assert_eq!(&packet[8 + 36..8 + 40], &[255, 255, 255, 0]);
        assert_eq!(&packet[8 + 52..8 + 56], &[192, 168, 0, 1]);

        let (header, decoded) = ForceIpCommand::decode(&packet).unwrap();
        assert!(header.ack_required());
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_readreg_exchange() {
        let cmd = readreg_cmd(11, &[CCP_REGISTER]);
        let (header, addrs) = decode_readreg_cmd(&cmd).unwrap();
        assert_eq!(header.req_id, 11);
        assert_eq!(addrs, vec![CCP_REGISTER]);

        let ack = readreg_ack(11, status::SUCCESS, &[CCP_CONTROL_ACCESS]);
        assert_eq!(decode_readreg_ack(&ack, 11).unwrap(), vec![CCP_CONTROL_ACCESS]);
        assert!(matches!(
            decode_readreg_ack(&ack, 12),
            Err(ProtocolError::AckIdMismatch { .. })
        ));
        let denied = readreg_ack(11, status::ACCESS_DENIED, &[]);
        assert_eq!(
            decode_readreg_ack(&denied, 11),
            Err(ProtocolError::Status(status::ACCESS_DENIED))
        );
    }

    #[test]
    fn test_bad_key_rejected() {
        let mut packet = discovery_cmd(1);
        packet[0] = 0x43;
        assert_eq!(CommandHeader::decode(&packet), Err(ProtocolError::BadKey(0x43)));
    }
}
