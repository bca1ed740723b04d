//! Immutable topology tree rooted at the host
//!
//! Trees are built wholesale from one enumeration and never mutated
//! afterwards. Children are owned through `Arc`, parents are weak
//! back-pointers, so a reader holding any node keeps a consistent (possibly
//! stale) view alive while a newer tree is published.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::warn;

use crate::device::{DeviceDescriptor, HardwareId, InterfaceType, NodeKind};
use crate::identity::DeviceIdentity;

/// A node in the topology tree
#[derive(Debug)]
pub struct TopologyNode {
    kind: NodeKind,
    identity: Option<DeviceIdentity>,
    hardware_id: Option<HardwareId>,
    interface: Option<InterfaceType>,
    port: Option<u8>,
    serial_number: Option<u32>,
    parent: Weak<TopologyNode>,
    children: Vec<Arc<TopologyNode>>,
}

impl TopologyNode {
    /// A tree holding only the host
    pub fn empty() -> Arc<Self> {
        Self::build(&[])
    }

    /// Build a tree from enumerated devices, keeping enumeration (port) order
    /// among siblings. Devices naming an unknown parent hang off the host;
    /// devices only reachable through a parent cycle are dropped.
    pub fn build(devices: &[(DeviceIdentity, &DeviceDescriptor)]) -> Arc<Self> {
        let present: HashSet<HardwareId> =
            devices.iter().map(|(_, d)| d.hardware_id).collect();

        let mut children_of: HashMap<Option<HardwareId>, Vec<usize>> = HashMap::new();
        for (idx, (_, device)) in devices.iter().enumerate() {
            let parent = match device.parent {
                Some(p) if present.contains(&p) && p != device.hardware_id => Some(p),
                Some(p) => {
                    warn!(
                        device = %device.hardware_id,
                        parent = %p,
                        "Parent not present in enumeration, attaching to host"
                    );
                    None
                }
                None => None,
            };
            children_of.entry(parent).or_default().push(idx);
        }

        let mut placed = HashSet::new();
        let root = Self::build_node(None, Weak::new(), devices, &children_of, &mut placed);

        if placed.len() < devices.len() {
            warn!(
                dropped = devices.len() - placed.len(),
                "Devices unreachable from host (parent cycle) left out of topology"
            );
        }
        root
    }

    fn build_node(
        entry: Option<usize>,
        parent: Weak<TopologyNode>,
        devices: &[(DeviceIdentity, &DeviceDescriptor)],
        children_of: &HashMap<Option<HardwareId>, Vec<usize>>,
        placed: &mut HashSet<usize>,
    ) -> Arc<TopologyNode> {
        let descriptor = entry.map(|idx| devices[idx]);
        let key = descriptor.map(|(_, d)| d.hardware_id);

        Arc::new_cyclic(|me| {
            let mut children = Vec::new();
            for &child in children_of.get(&key).map(Vec::as_slice).unwrap_or_default() {
                if placed.insert(child) {
                    children.push(Self::build_node(
                        Some(child),
                        me.clone(),
                        devices,
                        children_of,
                        placed,
                    ));
                }
            }

            match descriptor {
                Some((identity, device)) => TopologyNode {
                    kind: device.kind,
                    identity: Some(identity),
                    hardware_id: Some(device.hardware_id),
                    interface: Some(device.interface),
                    port: device.port,
                    serial_number: device.serial_number,
                    parent,
                    children,
                },
                None => TopologyNode {
                    kind: NodeKind::Host,
                    identity: None,
                    hardware_id: None,
                    interface: None,
                    port: None,
                    serial_number: None,
                    parent,
                    children,
                },
            }
        })
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Identity of the device; `None` for the host
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity
    }

    pub fn hardware_id(&self) -> Option<HardwareId> {
        self.hardware_id
    }

    pub fn interface(&self) -> Option<InterfaceType> {
        self.interface
    }

    pub fn port(&self) -> Option<u8> {
        self.port
    }

    pub fn serial_number(&self) -> Option<u32> {
        self.serial_number
    }

    /// Parent node, or `None` at the root or once the tree has been dropped
    pub fn parent(&self) -> Option<Arc<TopologyNode>> {
        self.parent.upgrade()
    }

    pub fn children(&self) -> &[Arc<TopologyNode>] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.kind == NodeKind::Host
    }

    /// This node and every descendant, depth-first in port order
    pub fn walk(self: &Arc<Self>) -> Vec<Arc<TopologyNode>> {
        let mut out = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(node) = stack.pop() {
            stack.extend(node.children.iter().rev().cloned());
            out.push(node);
        }
        out
    }

    pub fn find(self: &Arc<Self>, identity: DeviceIdentity) -> Option<Arc<TopologyNode>> {
        self.walk()
            .into_iter()
            .find(|node| node.identity == Some(identity))
    }

    /// Number of nodes below this one
    pub fn descendant_count(&self) -> usize {
        self.children
            .iter()
            .map(|c| 1 + c.descendant_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityArena;

    fn with_ids(
        arena: &mut IdentityArena,
        devices: &[DeviceDescriptor],
    ) -> Vec<DeviceIdentity> {
        devices.iter().map(|d| arena.bind(d.hardware_id)).collect()
    }

    #[test]
    fn test_tree_follows_parents_and_port_order() {
        let devices = vec![
            DeviceDescriptor::controller(1, InterfaceType::Usb),
            DeviceDescriptor::hub(2, InterfaceType::Usb).under(1, 1),
            DeviceDescriptor::camera(4, InterfaceType::Usb, 400).under(2, 2),
            DeviceDescriptor::camera(3, InterfaceType::Usb, 300).under(2, 1),
        ];
        let mut arena = IdentityArena::new();
        let ids = with_ids(&mut arena, &devices);
        let pairs: Vec<_> = ids.iter().copied().zip(devices.iter()).collect();

        let root = TopologyNode::build(&pairs);
        assert!(root.is_root());
        assert_eq!(root.descendant_count(), 4);

        let controller = &root.children()[0];
        assert_eq!(controller.kind(), NodeKind::Controller);
        let hub = &controller.children()[0];
        let serials: Vec<_> = hub.children().iter().map(|c| c.serial_number()).collect();
        // Enumeration order is kept, not re-sorted by port
        assert_eq!(serials, vec![Some(400), Some(300)]);

        let cam = root.find(ids[3]).unwrap();
        let parent = cam.parent().unwrap();
        assert_eq!(parent.hardware_id(), Some(HardwareId(2)));
        assert!(parent.parent().unwrap().parent().unwrap().is_root());
    }

    #[test]
    fn test_unknown_parent_attaches_to_host() {
        let devices = vec![DeviceDescriptor::camera(9, InterfaceType::SerialBus, 9).under(77, 0)];
        let mut arena = IdentityArena::new();
        let ids = with_ids(&mut arena, &devices);
        let pairs: Vec<_> = ids.iter().copied().zip(devices.iter()).collect();

        let root = TopologyNode::build(&pairs);
        assert_eq!(root.children().len(), 1);
        assert_eq!(root.children()[0].serial_number(), Some(9));
    }

    #[test]
    fn test_parent_cycle_is_dropped() {
        let devices = vec![
            DeviceDescriptor::hub(1, InterfaceType::Usb).under(2, 0),
            DeviceDescriptor::hub(2, InterfaceType::Usb).under(1, 0),
            DeviceDescriptor::camera(3, InterfaceType::Usb, 3),
        ];
        let mut arena = IdentityArena::new();
        let ids = with_ids(&mut arena, &devices);
        let pairs: Vec<_> = ids.iter().copied().zip(devices.iter()).collect();

        let root = TopologyNode::build(&pairs);
        assert_eq!(root.descendant_count(), 1);
        assert_eq!(root.walk().len(), 2);
    }

    #[test]
    fn test_empty_tree() {
        let root = TopologyNode::empty();
        assert!(root.is_root());
        assert!(root.parent().is_none());
        assert!(root.children().is_empty());
    }
}
