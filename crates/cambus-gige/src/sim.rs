//! Simulated GigE segment answering GVCP like real devices would

use cambus_core::{HostAdapter, IpConfig, MacAddress, Result};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

use crate::protocol::{
    decode_readreg_cmd, forceip_ack, readreg_ack, status, CommandHeader, DiscoveryAck,
    ForceIpCommand, CCP_REGISTER, DISCOVERY_CMD, FORCEIP_CMD, READREG_CMD,
};
use crate::transport::GvcpLink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCamera {
    pub mac: MacAddress,
    pub serial_number: u32,
    pub ip: IpConfig,
    /// Name of the host adapter whose broadcast domain the camera sits in
    pub segment: String,
    /// Control channel privilege register
    pub ccp: u32,
    /// Answer discovery with a truncated datagram
    pub malformed: bool,
    /// Drop FORCEIP commands without changing or acknowledging
    pub ignore_force_ip: bool,
    /// Times a FORCEIP actually changed the configuration
    pub reconfigurations: usize,
}

impl SimCamera {
    pub fn new(mac: MacAddress, serial_number: u32, ip: IpConfig, segment: &str) -> Self {
        Self {
            mac,
            serial_number,
            ip,
            segment: segment.to_string(),
            ccp: 0,
            malformed: false,
            ignore_force_ip: false,
            reconfigurations: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct SimulatedGigeNetwork {
    cameras: Mutex<Vec<SimCamera>>,
}

impl SimulatedGigeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn cameras_mut(&self) -> MutexGuard<'_, Vec<SimCamera>> {
        self.cameras.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_camera(&self, camera: SimCamera) {
        self.cameras_mut().push(camera);
    }

    pub fn camera(&self, mac: MacAddress) -> Option<SimCamera> {
        self.cameras_mut().iter().find(|c| c.mac == mac).cloned()
    }

    pub fn cameras(&self) -> Vec<SimCamera> {
        self.cameras_mut().clone()
    }

    pub fn set_ccp(&self, mac: MacAddress, ccp: u32) {
        if let Some(cam) = self.cameras_mut().iter_mut().find(|c| c.mac == mac) {
            cam.ccp = ccp;
        }
    }

    fn answer_broadcast(&self, adapter: &HostAdapter, packet: &[u8]) -> Result<Vec<Vec<u8>>> {
        let header = CommandHeader::decode(packet)?;
        let mut cameras = self.cameras_mut();
        let on_segment = cameras.iter_mut().filter(|c| c.segment == adapter.name);

        let replies = match header.command {
            DISCOVERY_CMD => on_segment
                .map(|cam| {
                    let ack = DiscoveryAck::new(cam.mac, cam.ip, cam.serial_number)
                        .encode(header.req_id);
                    if cam.malformed {
                        ack[..40].to_vec()
                    } else {
                        ack
                    }
                })
                .collect(),
            FORCEIP_CMD => {
                let (_, cmd) = ForceIpCommand::decode(packet)?;
                let mut replies = Vec::new();
                for cam in on_segment.filter(|c| c.mac == cmd.mac && !c.ignore_force_ip) {
                    if cam.ip != cmd.config {
                        cam.ip = cmd.config;
                        cam.reconfigurations += 1;
                    }
                    if header.ack_required() {
                        replies.push(forceip_ack(header.req_id));
                    }
                }
                replies
            }
            _ => Vec::new(),
        };

        trace!(
            adapter = %adapter.name,
            command = header.command,
            replies = replies.len(),
            "Simulated segment answered"
        );
        Ok(replies)
    }
}

impl GvcpLink for SimulatedGigeNetwork {
    async fn broadcast(
        &self,
        adapter: &HostAdapter,
        packet: &[u8],
        _window: Duration,
    ) -> Result<Vec<Vec<u8>>> {
        self.answer_broadcast(adapter, packet)
    }

    async fn request(
        &self,
        device: Ipv4Addr,
        packet: &[u8],
        _wait: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let (header, addrs) = match CommandHeader::decode(packet)?.command {
            READREG_CMD => decode_readreg_cmd(packet)?,
            _ => return Ok(None),
        };
        let cameras = self.cameras_mut();
        let Some(cam) = cameras.iter().find(|c| c.ip.address == device) else {
            return Ok(None);
        };

        let mut values = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if addr != CCP_REGISTER {
                return Ok(Some(readreg_ack(header.req_id, status::INVALID_ADDRESS, &[])));
            }
            values.push(cam.ccp);
        }
        Ok(Some(readreg_ack(header.req_id, status::SUCCESS, &values)))
    }
}
