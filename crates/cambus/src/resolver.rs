//! Enumeration snapshots and identity resolution
//!
//! A [`Snapshot`] is one published enumeration: devices in transport order,
//! the camera subset, and the topology tree built from them. Snapshots are
//! never modified; a rescan publishes a new one. Every lookup on a snapshot
//! is synchronous and never touches hardware.

use cambus_core::{
    BusError, DeviceDescriptor, DeviceIdentity, HardwareId, IdentityArena, InterfaceType,
    Result, TopologyNode,
};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::events::BusEvent;

#[derive(Debug, Clone)]
struct Entry {
    identity: DeviceIdentity,
    device: DeviceDescriptor,
}

/// One immutable enumeration of every bus
#[derive(Debug)]
pub struct Snapshot {
    epoch: u64,
    entries: Vec<Entry>,
    /// Positions in `entries` of camera-capable devices
    cameras: Vec<usize>,
    by_identity: HashMap<DeviceIdentity, usize>,
    topology: Arc<TopologyNode>,
}

impl Snapshot {
    pub(crate) fn empty() -> Self {
        Self {
            epoch: 0,
            entries: Vec::new(),
            cameras: Vec::new(),
            by_identity: HashMap::new(),
            topology: TopologyNode::empty(),
        }
    }

    fn build(epoch: u64, entries: Vec<Entry>) -> Self {
        let cameras = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.device.is_camera())
            .map(|(idx, _)| idx)
            .collect();
        let by_identity = entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.identity, idx))
            .collect();
        let pairs: Vec<(DeviceIdentity, &DeviceDescriptor)> =
            entries.iter().map(|e| (e.identity, &e.device)).collect();
        let topology = TopologyNode::build(&pairs);

        Self {
            epoch,
            entries,
            cameras,
            by_identity,
            topology,
        }
    }

    /// Increments on every published rebuild
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn num_devices(&self) -> usize {
        self.entries.len()
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn device_from_index(&self, index: usize) -> Result<DeviceIdentity> {
        self.entries
            .get(index)
            .map(|e| e.identity)
            .ok_or_else(|| out_of_range("device", index, self.entries.len()))
    }

    pub fn camera_from_index(&self, index: usize) -> Result<DeviceIdentity> {
        self.camera_at(index).map(|e| e.identity)
    }

    pub fn camera_serial_from_index(&self, index: usize) -> Result<u32> {
        let entry = self.camera_at(index)?;
        entry.device.serial_number.ok_or_else(|| {
            BusError::NotFound(format!("camera {} reports no serial number", index))
        })
    }

    pub fn camera_from_serial(&self, serial_number: u32) -> Result<DeviceIdentity> {
        self.cameras
            .iter()
            .map(|&idx| &self.entries[idx])
            .find(|e| e.device.serial_number == Some(serial_number))
            .map(|e| e.identity)
            .ok_or_else(|| BusError::NotFound(format!("no camera with serial {}", serial_number)))
    }

    /// Only network devices have an address to match against
    pub fn camera_from_ip(&self, ip: Ipv4Addr) -> Result<DeviceIdentity> {
        let entry = self
            .cameras
            .iter()
            .map(|&idx| &self.entries[idx])
            .find(|e| e.device.ip == Some(ip))
            .ok_or_else(|| BusError::NotFound(format!("no camera at {}", ip)))?;

        if !entry.device.interface.capabilities().ip_addressing {
            return Err(BusError::not_supported(
                entry.device.interface,
                "network address lookup",
            ));
        }
        Ok(entry.identity)
    }

    /// Descriptor of a device in this snapshot; identities issued by any
    /// earlier snapshot and since retired are reported as stale
    pub fn descriptor(&self, identity: DeviceIdentity) -> Result<&DeviceDescriptor> {
        self.by_identity
            .get(&identity)
            .map(|&idx| &self.entries[idx].device)
            .ok_or(BusError::StaleIdentity(identity))
    }

    pub fn interface_type(&self, identity: DeviceIdentity) -> Result<InterfaceType> {
        Ok(self.descriptor(identity)?.interface)
    }

    pub fn serial_number(&self, identity: DeviceIdentity) -> Result<u32> {
        self.descriptor(identity)?.serial_number.ok_or_else(|| {
            BusError::NotFound(format!("device {} has no serial number", identity))
        })
    }

    pub fn contains(&self, identity: DeviceIdentity) -> bool {
        self.by_identity.contains_key(&identity)
    }

    pub fn topology(&self) -> Arc<TopologyNode> {
        self.topology.clone()
    }

    /// Every device with its identity, in enumeration order
    pub fn devices(&self) -> impl Iterator<Item = (DeviceIdentity, &DeviceDescriptor)> {
        self.entries.iter().map(|e| (e.identity, &e.device))
    }

    fn camera_at(&self, index: usize) -> Result<&Entry> {
        self.cameras
            .get(index)
            .map(|&idx| &self.entries[idx])
            .ok_or_else(|| out_of_range("camera", index, self.cameras.len()))
    }
}

fn out_of_range(what: &str, index: usize, count: usize) -> BusError {
    BusError::NotFound(format!(
        "{} index {} out of range, {} present",
        what, index, count
    ))
}

/// Fold a fresh enumeration into the identity arena and produce the next
/// snapshot plus the events describing the change.
///
/// Only devices that disappeared lose their identity. With `reset` every
/// identity is retired first and a `BusReset` leads the event list.
pub(crate) fn reconcile(
    arena: &mut IdentityArena,
    previous: &Snapshot,
    devices: Vec<DeviceDescriptor>,
    reset: bool,
) -> (Snapshot, Vec<BusEvent>) {
    let mut seen = HashSet::new();
    let devices: Vec<DeviceDescriptor> = devices
        .into_iter()
        .filter(|d| {
            let fresh = seen.insert(d.hardware_id);
            if !fresh {
                warn!(device = %d.hardware_id, "Duplicate device in enumeration, ignoring");
            }
            fresh
        })
        .collect();

    let before: HashSet<HardwareId> = previous
        .entries
        .iter()
        .map(|e| e.device.hardware_id)
        .collect();

    let mut events = Vec::new();
    if reset {
        arena.release_all();
        events.push(BusEvent::BusReset);
    }

    for gone in previous.entries.iter().filter(|e| !seen.contains(&e.device.hardware_id)) {
        let hw = gone.device.hardware_id;
        if let Some(identity) = arena.release(hw) {
            debug!(device = %hw, identity = %identity, "Retired identity");
        }
        if let Some(serial_number) = gone.device.serial_number {
            events.push(BusEvent::Removal { serial_number });
        }
    }

    let mut entries = Vec::with_capacity(devices.len());
    for device in devices {
        let identity = arena.bind(device.hardware_id);
        if !before.contains(&device.hardware_id) {
            if let Some(serial_number) = device.serial_number {
                events.push(BusEvent::Arrival { serial_number });
            }
        }
        entries.push(Entry { identity, device });
    }

    (Snapshot::build(previous.epoch + 1, entries), events)
}
