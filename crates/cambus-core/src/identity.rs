//! Opaque device identities backed by a generational arena
//!
//! A [`DeviceIdentity`] is a slot index plus the generation the slot had when
//! the identity was issued. Releasing a slot bumps its generation, so an
//! identity held across a topology change is detected as stale instead of
//! silently aliasing whichever device reuses the slot.

use std::collections::HashMap;

use crate::device::HardwareId;

/// Transport-independent token naming one attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity {
    slot: u32,
    generation: u32,
}

impl DeviceIdentity {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}@{}", self.slot, self.generation)
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u32,
    hardware: Option<HardwareId>,
}

/// Issues identities and tracks which hardware each live slot is bound to
#[derive(Debug, Clone, Default)]
pub struct IdentityArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    bound: HashMap<HardwareId, u32>,
}

impl IdentityArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity for `hardware`, reusing the existing binding when there is one
    pub fn bind(&mut self, hardware: HardwareId) -> DeviceIdentity {
        if let Some(&slot) = self.bound.get(&hardware) {
            return self.identity_at(slot);
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        self.slots[slot as usize].hardware = Some(hardware);
        self.bound.insert(hardware, slot);
        self.identity_at(slot)
    }

    /// Retire the identity bound to `hardware`; returns it if one existed
    pub fn release(&mut self, hardware: HardwareId) -> Option<DeviceIdentity> {
        let slot = self.bound.remove(&hardware)?;
        let retired = self.identity_at(slot);
        let entry = &mut self.slots[slot as usize];
        entry.generation = entry.generation.wrapping_add(1);
        entry.hardware = None;
        self.free.push(slot);
        Some(retired)
    }

    /// Retire every live identity
    pub fn release_all(&mut self) {
        let mut live: Vec<HardwareId> = self.bound.keys().copied().collect();
        // Highest slot first so the free list hands slots back in ascending order
        live.sort_by_key(|hw| std::cmp::Reverse(self.bound[hw]));
        for hardware in live {
            self.release(hardware);
        }
    }

    pub fn lookup(&self, hardware: HardwareId) -> Option<DeviceIdentity> {
        self.bound.get(&hardware).map(|&slot| self.identity_at(slot))
    }

    /// Hardware a live identity is bound to; `None` for stale identities
    pub fn resolve(&self, identity: DeviceIdentity) -> Option<HardwareId> {
        let slot = self.slots.get(identity.slot as usize)?;
        if slot.generation == identity.generation {
            slot.hardware
        } else {
            None
        }
    }

    pub fn is_live(&self, identity: DeviceIdentity) -> bool {
        self.resolve(identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    fn identity_at(&self, slot: u32) -> DeviceIdentity {
        DeviceIdentity {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }
}
