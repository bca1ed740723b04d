//! Out-of-subnet GigE camera discovery

use cambus_core::{BusError, CameraInfo, HostAdapter, MacAddress, Result};
use cambus_gige::{DiscoveryAck, GvcpLink, UdpGvcpLink};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::{debug, info, warn};

use crate::adapter::detect_adapters;
use crate::config::DiscoveryConfig;

/// GigE devices reachable from a set of host adapters
pub struct GigeNetwork<L: GvcpLink> {
    pub(crate) link: L,
    pub(crate) adapters: Vec<HostAdapter>,
    pub(crate) config: DiscoveryConfig,
    req_id: AtomicU16,
}

impl GigeNetwork<UdpGvcpLink> {
    /// Use the host's own adapters over real UDP
    pub fn detect(config: DiscoveryConfig) -> Result<Self> {
        let adapters =
            detect_adapters(&config).map_err(|e| BusError::Generic(e.to_string()))?;
        let link = UdpGvcpLink::with_port(config.gvcp_port);
        Ok(Self::new(link, adapters, config))
    }
}

impl<L: GvcpLink> GigeNetwork<L> {
    pub fn new(link: L, adapters: Vec<HostAdapter>, config: DiscoveryConfig) -> Self {
        Self {
            link,
            adapters,
            config,
            req_id: AtomicU16::new(1),
        }
    }

    pub fn adapters(&self) -> &[HostAdapter] {
        &self.adapters
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Next GVCP request id; zero is reserved
    pub(crate) fn next_req_id(&self) -> u16 {
        loop {
            let id = self.req_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Discover every camera, failing with `BufferTooSmall` (and the count
    /// needed) rather than truncating when more than `capacity` answer
    pub async fn discover(&self, capacity: usize) -> Result<Vec<CameraInfo>> {
        let cameras = self.discover_all().await;
        if cameras.len() > capacity {
            return Err(BusError::BufferTooSmall {
                required: cameras.len(),
                capacity,
            });
        }
        Ok(cameras)
    }

    /// Broadcast a discovery request on every adapter and collect replies.
    /// Quiet adapters and misbehaving devices only shrink the result.
    pub async fn discover_all(&self) -> Vec<CameraInfo> {
        let mut cameras = Vec::new();
        let mut seen: HashSet<MacAddress> = HashSet::new();

        for adapter in &self.adapters {
            let req_id = self.next_req_id();
            let packet = cambus_gige::protocol::discovery_cmd(req_id);

            let replies = match self
                .link
                .broadcast(adapter, &packet, self.config.discovery_window())
                .await
            {
                Ok(replies) => replies,
                Err(e) => {
                    warn!(adapter = %adapter.name, error = %e, "Discovery broadcast failed");
                    continue;
                }
            };

            for reply in replies {
                let Some(mut info) = parse_reply(&reply, req_id, adapter) else {
                    continue;
                };
                if seen.insert(info.mac) {
                    info.adapter = Some(adapter.name.clone());
                    cameras.push(info);
                } else {
                    debug!(mac = %info.mac, adapter = %adapter.name, "Camera already seen on another adapter");
                }
            }
        }

        info!(found = cameras.len(), "GigE discovery complete");
        cameras
    }

    /// Adapter a previously discovered camera answered on
    pub(crate) fn adapter_named(&self, name: &str) -> Option<&HostAdapter> {
        self.adapters.iter().find(|a| a.name == name)
    }
}

fn parse_reply(reply: &[u8], req_id: u16, adapter: &HostAdapter) -> Option<CameraInfo> {
    let (header, ack) = match DiscoveryAck::decode(reply) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(adapter = %adapter.name, error = %e, "Ignoring malformed discovery reply");
            return None;
        }
    };
    if header.ack_id != req_id {
        debug!(
            expected = req_id,
            actual = header.ack_id,
            "Ignoring discovery reply to another request"
        );
        return None;
    }
    match ack.to_camera_info() {
        Ok(info) => Some(info),
        Err(e) => {
            warn!(mac = %ack.mac, error = %e, "Ignoring discovery reply");
            None
        }
    }
}
