//! Forced IP assignment and control privilege queries
//!
//! Devices are addressed by MAC inside a broadcast datagram, so a camera
//! whose current address is unreachable from the host can still be moved
//! onto the subnet of the adapter it is physically plugged into.

use cambus_core::{BusError, CameraInfo, HostAdapter, IpConfig, MacAddress, Result};
use cambus_gige::protocol::{
    decode_readreg_ack, readreg_cmd, AckHeader, CCP_CONTROL_ACCESS, CCP_EXCLUSIVE_ACCESS,
    CCP_REGISTER, FORCEIP_ACK,
};
use cambus_gige::{ForceIpCommand, GvcpLink};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use crate::arp::{claimed_addresses, get_arp_table, ArpEntry};
use crate::discovery::GigeNetwork;

/// One address handed out by auto-assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAssignment {
    pub serial_number: u32,
    pub mac: MacAddress,
    pub adapter: String,
    pub previous: IpConfig,
    pub assigned: IpConfig,
}

/// Outcome of an auto-assignment run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentReport {
    /// Cameras that acknowledged their new address
    pub applied: Vec<IpAssignment>,
    /// Planned moves no device acknowledged in time
    pub unacknowledged: Vec<IpAssignment>,
}

impl AssignmentReport {
    /// Every planned camera acknowledged
    pub fn is_complete(&self) -> bool {
        self.unacknowledged.is_empty()
    }
}

/// Walks an adapter's host range lowest first, skipping anything taken
struct AddressPool<'a> {
    adapter: &'a HostAdapter,
    taken: HashSet<Ipv4Addr>,
    next: Box<dyn Iterator<Item = Ipv4Addr> + 'a>,
}

impl<'a> AddressPool<'a> {
    fn new(adapter: &'a HostAdapter, occupied: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let mut taken: HashSet<Ipv4Addr> = occupied.into_iter().collect();
        taken.insert(adapter.address);
        if let Some(gateway) = adapter.gateway {
            taken.insert(gateway);
        }
        Self {
            adapter,
            taken,
            next: Box::new(adapter.host_range()),
        }
    }

    fn allocate(&mut self) -> Result<Ipv4Addr> {
        for candidate in self.next.by_ref() {
            if self.taken.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(BusError::AddressExhausted {
            network: self.adapter.network(),
            prefix_len: self.adapter.prefix_len(),
        })
    }
}

/// Pick new addresses for every out-of-subnet camera (or only `only`).
///
/// Cameras are grouped by the adapter they answered on. Occupied addresses
/// are the adapter itself, its gateway, cameras already inside the subnet
/// and `neighbours`.
pub fn plan_assignments(
    adapters: &[HostAdapter],
    cameras: &[CameraInfo],
    neighbours: &[ArpEntry],
    only: Option<u32>,
) -> Result<Vec<IpAssignment>> {
    let mut by_adapter: BTreeMap<&str, Vec<&CameraInfo>> = BTreeMap::new();
    for camera in cameras {
        match camera.adapter.as_deref() {
            Some(name) => by_adapter.entry(name).or_default().push(camera),
            None => debug!(serial = camera.serial_number, "Camera has no known adapter, skipping"),
        }
    }

    let mut plan = Vec::new();
    for (name, group) in by_adapter {
        let Some(adapter) = adapters.iter().find(|a| a.name == name) else {
            warn!(adapter = name, "Camera answered on an unknown adapter");
            continue;
        };

        let pending: Vec<&CameraInfo> = group
            .iter()
            .copied()
            .filter(|c| !adapter.shares_subnet(&c.ip_config))
            .filter(|c| only.map_or(true, |serial| c.serial_number == serial))
            .collect();
        if pending.is_empty() {
            continue;
        }

        let occupied = group
            .iter()
            .map(|c| c.ip_config.address)
            .filter(|ip| adapter.contains(*ip))
            .chain(claimed_addresses(neighbours, &adapter.name));
        let mut pool = AddressPool::new(adapter, occupied);

        for camera in pending {
            let address = pool.allocate()?;
            let assigned = IpConfig::new(
                address,
                adapter.netmask,
                adapter.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
            );
            plan.push(IpAssignment {
                serial_number: camera.serial_number,
                mac: camera.mac,
                adapter: adapter.name.clone(),
                previous: camera.ip_config,
                assigned,
            });
        }
    }
    Ok(plan)
}

impl<L: GvcpLink> GigeNetwork<L> {
    /// Tell the device with `mac` to adopt `config`. Succeeds once the
    /// device acknowledges on any adapter; re-sending the current
    /// configuration is harmless.
    pub async fn force_ip(&self, mac: MacAddress, config: IpConfig) -> Result<()> {
        if mac.octets() == [0; 6] || mac.octets() == [0xFF; 6] {
            return Err(BusError::InvalidParameter(format!(
                "{} cannot address a single device",
                mac
            )));
        }
        config.validate()?;

        for adapter in &self.adapters {
            if self.force_ip_via(adapter, mac, config).await? {
                info!(
                    mac = %mac,
                    ip = %config.address,
                    adapter = %adapter.name,
                    "Device accepted forced IP"
                );
                return Ok(());
            }
        }
        Err(BusError::Timeout(self.config.force_ip_timeout()))
    }

    async fn force_ip_via(
        &self,
        adapter: &HostAdapter,
        mac: MacAddress,
        config: IpConfig,
    ) -> Result<bool> {
        let req_id = self.next_req_id();
        let packet = ForceIpCommand { mac, config }.encode(req_id, true);
        let replies = match self
            .link
            .broadcast(adapter, &packet, self.config.force_ip_timeout())
            .await
        {
            Ok(replies) => replies,
            Err(e) => {
                warn!(adapter = %adapter.name, error = %e, "FORCEIP broadcast failed");
                return Ok(false);
            }
        };

        for reply in replies {
            match AckHeader::expect(&reply, FORCEIP_ACK) {
                Ok(header) if header.ack_id == req_id => return Ok(true),
                Ok(header) => {
                    debug!(expected = req_id, actual = header.ack_id, "Stale FORCEIP ack")
                }
                Err(e) => debug!(adapter = %adapter.name, error = %e, "Ignoring FORCEIP reply"),
            }
        }
        Ok(false)
    }

    /// Move every discovered camera that cannot be reached without routing
    /// onto the subnet of its adapter. A camera that does not acknowledge
    /// is reported and does not hold back the others.
    pub async fn auto_assign_all(&self) -> Result<AssignmentReport> {
        let cameras = self.discover_all().await;
        self.apply_plan(&cameras, None).await
    }

    /// Same as [`auto_assign_all`](Self::auto_assign_all) for one camera.
    /// Returns `None` when the camera is already reachable.
    pub async fn auto_assign(&self, serial_number: u32) -> Result<Option<IpAssignment>> {
        let cameras = self.discover_all().await;
        if !cameras.iter().any(|c| c.serial_number == serial_number) {
            return Err(BusError::NotFound(format!(
                "no GigE camera with serial {} answered discovery",
                serial_number
            )));
        }
        let report = self.apply_plan(&cameras, Some(serial_number)).await?;
        if !report.is_complete() {
            return Err(BusError::Timeout(self.config.force_ip_timeout()));
        }
        Ok(report.applied.into_iter().next())
    }

    async fn apply_plan(
        &self,
        cameras: &[CameraInfo],
        only: Option<u32>,
    ) -> Result<AssignmentReport> {
        let neighbours = self.neighbours();
        let plan = plan_assignments(&self.adapters, cameras, &neighbours, only)?;

        let mut report = AssignmentReport::default();
        for assignment in plan {
            let Some(adapter) = self.adapter_named(&assignment.adapter) else {
                continue;
            };
            if !self
                .force_ip_via(adapter, assignment.mac, assignment.assigned)
                .await?
            {
                warn!(
                    serial = assignment.serial_number,
                    mac = %assignment.mac,
                    to = %assignment.assigned.address,
                    adapter = %assignment.adapter,
                    "Camera did not acknowledge forced IP"
                );
                report.unacknowledged.push(assignment);
                continue;
            }
            info!(
                serial = assignment.serial_number,
                from = %assignment.previous.address,
                to = %assignment.assigned.address,
                adapter = %assignment.adapter,
                "Auto-assigned IP address"
            );
            report.applied.push(assignment);
        }
        Ok(report)
    }

    fn neighbours(&self) -> Vec<ArpEntry> {
        if !self.config.consult_arp_table {
            return Vec::new();
        }
        get_arp_table().unwrap_or_else(|e| {
            warn!(error = %e, "ARP table unavailable, assuming no neighbours");
            Vec::new()
        })
    }

    /// Whether no other application holds control of the device at `ip`
    pub async fn is_controllable(&self, ip: Ipv4Addr) -> Result<bool> {
        let req_id = self.next_req_id();
        let packet = readreg_cmd(req_id, &[CCP_REGISTER]);
        let wait = self.config.register_timeout();

        let reply = self
            .link
            .request(ip, &packet, wait)
            .await?
            .ok_or(BusError::Timeout(wait))?;
        let values = decode_readreg_ack(&reply, req_id)?;
        let ccp = values.first().copied().ok_or_else(|| {
            BusError::Generic(format!("READREG ack from {} carried no value", ip))
        })?;

        debug!(ip = %ip, ccp = ccp, "Read control channel privilege");
        Ok(ccp & (CCP_EXCLUSIVE_ACCESS | CCP_CONTROL_ACCESS) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use cambus_gige::{SimCamera, SimulatedGigeNetwork};

    fn adapter() -> HostAdapter {
        HostAdapter::new(
            "gige0",
            Ipv4Addr::new(192, 168, 10, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        )
    }

    fn link_local(last: u8) -> IpConfig {
        IpConfig::new(
            Ipv4Addr::new(169, 254, 7, last),
            Ipv4Addr::new(255, 255, 0, 0),
            Ipv4Addr::UNSPECIFIED,
        )
    }

    fn camera_info(serial: u32, last: u8, ip: IpConfig) -> CameraInfo {
        let mut info = CameraInfo::new(serial, MacAddress([0, 0xb0, 0x9d, 0, 2, last]), ip);
        info.adapter = Some("gige0".to_string());
        info
    }

    fn network(cameras: Vec<SimCamera>) -> GigeNetwork<SimulatedGigeNetwork> {
        let sim = SimulatedGigeNetwork::new();
        for cam in cameras {
            sim.add_camera(cam);
        }
        let config = DiscoveryConfig {
            consult_arp_table: false,
            ..Default::default()
        };
        let adapter = adapter().with_gateway(Ipv4Addr::new(192, 168, 10, 2));
        GigeNetwork::new(sim, vec![adapter], config)
    }

    #[test]
    fn test_plan_skips_occupied_addresses() {
        let adapter = adapter().with_gateway(Ipv4Addr::new(192, 168, 10, 2));
        let in_subnet = IpConfig::new(
            Ipv4Addr::new(192, 168, 10, 3),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::UNSPECIFIED,
        );
        let cameras = vec![
            camera_info(1, 1, link_local(1)),
            camera_info(2, 2, in_subnet),
            camera_info(3, 3, link_local(3)),
        ];
        let neighbours = vec![ArpEntry {
            ip: Ipv4Addr::new(192, 168, 10, 4),
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
            interface: "gige0".to_string(),
            state: crate::arp::ArpState::Reachable,
        }];

        let plan = plan_assignments(&[adapter], &cameras, &neighbours, None).unwrap();
        let assigned: Vec<_> = plan.iter().map(|a| (a.serial_number, a.assigned.address)).collect();
        assert_eq!(
            assigned,
            vec![
                (1, Ipv4Addr::new(192, 168, 10, 5)),
                (3, Ipv4Addr::new(192, 168, 10, 6)),
            ]
        );
        assert!(plan
            .iter()
            .all(|a| a.assigned.subnet_mask == Ipv4Addr::new(255, 255, 255, 0)
                && a.assigned.gateway == Ipv4Addr::new(192, 168, 10, 2)));
    }

    #[test]
    fn test_plan_reports_exhaustion() {
        let tiny = HostAdapter::new(
            "gige0",
            Ipv4Addr::new(10, 9, 0, 1),
            Ipv4Addr::new(255, 255, 255, 252),
        )
        .with_gateway(Ipv4Addr::new(10, 9, 0, 2));
        let cameras = vec![camera_info(1, 1, link_local(1))];
        assert_eq!(
            plan_assignments(&[tiny], &cameras, &[], None),
            Err(BusError::AddressExhausted {
                network: Ipv4Addr::new(10, 9, 0, 0),
                prefix_len: 30,
            })
        );
    }

    #[tokio::test]
    async fn test_force_ip_is_idempotent() {
        let mac = MacAddress([0, 0xb0, 0x9d, 0, 2, 1]);
        let net = network(vec![SimCamera::new(mac, 1, link_local(1), "gige0")]);
        let target = IpConfig::new(
            Ipv4Addr::new(192, 168, 10, 50),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 10, 2),
        );

        net.force_ip(mac, target).await.unwrap();
        net.force_ip(mac, target).await.unwrap();

        let cam = net.link().camera(mac).unwrap();
        assert_eq!(cam.ip, target);
        assert_eq!(cam.reconfigurations, 1);
    }

    #[tokio::test]
    async fn test_force_ip_rejects_bad_input() {
        let net = network(Vec::new());
        let broadcast_host = IpConfig::new(
            Ipv4Addr::new(192, 168, 10, 255),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::UNSPECIFIED,
        );
        assert!(matches!(
            net.force_ip(MacAddress([0, 1, 2, 3, 4, 5]), broadcast_host).await,
            Err(BusError::InvalidParameter(_))
        ));
        assert!(matches!(
            net.force_ip(MacAddress([0xFF; 6]), link_local(1)).await,
            Err(BusError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_force_ip_to_absent_device_times_out() {
        let net = network(Vec::new());
        let result = net.force_ip(MacAddress([0, 1, 2, 3, 4, 5]), link_local(9)).await;
        assert!(matches!(result, Err(BusError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_auto_assign_single_camera() {
        let net = network(vec![
            SimCamera::new(MacAddress([0, 0xb0, 0x9d, 0, 2, 1]), 11, link_local(1), "gige0"),
            SimCamera::new(MacAddress([0, 0xb0, 0x9d, 0, 2, 2]), 12, link_local(2), "gige0"),
        ]);

        let assignment = net.auto_assign(12).await.unwrap().unwrap();
        assert_eq!(assignment.assigned.address, Ipv4Addr::new(192, 168, 10, 3));

        // Only the requested camera moved
        let untouched = net.link().camera(MacAddress([0, 0xb0, 0x9d, 0, 2, 1])).unwrap();
        assert_eq!(untouched.ip, link_local(1));

        // Already reachable now
        assert_eq!(net.auto_assign(12).await.unwrap(), None);
        assert!(matches!(net.auto_assign(99).await, Err(BusError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_silent_camera_does_not_block_others() {
        let mut silent = SimCamera::new(
            MacAddress([0, 0xb0, 0x9d, 0, 2, 1]),
            21,
            link_local(1),
            "gige0",
        );
        silent.ignore_force_ip = true;
        let net = network(vec![
            silent,
            SimCamera::new(MacAddress([0, 0xb0, 0x9d, 0, 2, 2]), 22, link_local(2), "gige0"),
            SimCamera::new(MacAddress([0, 0xb0, 0x9d, 0, 2, 3]), 23, link_local(3), "gige0"),
        ]);

        let report = net.auto_assign_all().await.unwrap();
        assert!(!report.is_complete());
        let failed: Vec<_> = report.unacknowledged.iter().map(|a| a.serial_number).collect();
        assert_eq!(failed, vec![21]);
        let moved: Vec<_> = report.applied.iter().map(|a| a.serial_number).collect();
        assert_eq!(moved.len(), 2);
        assert!(moved.contains(&22) && moved.contains(&23));

        for assignment in &report.applied {
            let cam = net.link().camera(assignment.mac).unwrap();
            assert_eq!(cam.ip, assignment.assigned);
        }
        let unchanged = net.link().camera(MacAddress([0, 0xb0, 0x9d, 0, 2, 1])).unwrap();
        assert_eq!(unchanged.ip, link_local(1));
        assert!(matches!(net.auto_assign(21).await, Err(BusError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_controllable_follows_ccp() {
        let mac = MacAddress([0, 0xb0, 0x9d, 0, 2, 1]);
        let net = network(vec![SimCamera::new(mac, 1, link_local(1), "gige0")]);
        let ip = link_local(1).address;

        assert!(net.is_controllable(ip).await.unwrap());
        net.link().set_ccp(mac, CCP_CONTROL_ACCESS);
        assert!(!net.is_controllable(ip).await.unwrap());
        assert!(matches!(
            net.is_controllable(Ipv4Addr::new(10, 1, 1, 1)).await,
            Err(BusError::Timeout(_))
        ));
    }
}
