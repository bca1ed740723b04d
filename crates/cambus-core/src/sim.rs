//! In-memory bus driver for tests and bring-up without hardware

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::{DeviceDescriptor, HardwareId};
use crate::driver::{BusDriver, HotplugNotice};
use crate::error::{BusError, Result};
use crate::register::{PortRegister, PortStatus, RegisterAddress, PHY_VALUE_MASK};

#[derive(Debug, Default)]
struct SimState {
    devices: Vec<DeviceDescriptor>,
    registers: HashMap<(HardwareId, RegisterAddress), u32>,
    register_latency: Option<Duration>,
    enumerate_failure: Option<BusError>,
    reset_failure: Option<BusError>,
    enumerations: usize,
    resets: Vec<HardwareId>,
}

/// Simulated bus whose topology tests mutate directly
pub struct SimulatedBus {
    state: Mutex<SimState>,
    hotplug_tx: mpsc::UnboundedSender<HotplugNotice>,
    hotplug_rx: Mutex<Option<mpsc::UnboundedReceiver<HotplugNotice>>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::with_devices(Vec::new())
    }

    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        let (hotplug_tx, hotplug_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(SimState {
                devices,
                ..Default::default()
            }),
            hotplug_tx,
            hotplug_rx: Mutex::new(Some(hotplug_rx)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Plug a device in without notifying anyone
    pub fn insert(&self, device: DeviceDescriptor) {
        self.state().devices.push(device);
    }

    /// Unplug a device (and anything below it) without notifying anyone
    pub fn remove(&self, hardware_id: HardwareId) {
        let mut state = self.state();
        let mut doomed = vec![hardware_id];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i];
            let below: Vec<HardwareId> = state
                .devices
                .iter()
                .filter(|d| d.parent == Some(parent) && !doomed.contains(&d.hardware_id))
                .map(|d| d.hardware_id)
                .collect();
            doomed.extend(below);
            i += 1;
        }
        state.devices.retain(|d| !doomed.contains(&d.hardware_id));
    }

    /// Plug a device in and raise a hot-plug notice
    pub fn attach(&self, device: DeviceDescriptor) {
        debug!(device = %device.hardware_id, "Simulated attach");
        self.insert(device);
        let _ = self.hotplug_tx.send(HotplugNotice::Attached);
    }

    /// Unplug a device and raise a hot-plug notice
    pub fn detach(&self, hardware_id: HardwareId) {
        debug!(device = %hardware_id, "Simulated detach");
        self.remove(hardware_id);
        let _ = self.hotplug_tx.send(HotplugNotice::Detached);
    }

    /// Raise a reset notice as if another host reset the bus
    pub fn external_reset(&self) {
        let _ = self.hotplug_tx.send(HotplugNotice::Reset);
    }

    /// Delay every register access, to exercise timeouts
    pub fn set_register_latency(&self, latency: Option<Duration>) {
        self.state().register_latency = latency;
    }

    /// Make the next enumeration fail with `error`
    pub fn fail_next_enumeration(&self, error: BusError) {
        self.state().enumerate_failure = Some(error);
    }

    /// Make the next reset fail with `error`
    pub fn fail_next_reset(&self, error: BusError) {
        self.state().reset_failure = Some(error);
    }

    pub fn enumeration_count(&self) -> usize {
        self.state().enumerations
    }

    /// Devices a reset was fired through, oldest first
    pub fn resets(&self) -> Vec<HardwareId> {
        self.state().resets.clone()
    }

    pub fn set_register(&self, device: HardwareId, address: RegisterAddress, value: u32) {
        self.state().registers.insert((device, address), value);
    }

    fn check_present(state: &SimState, device: HardwareId) -> Result<()> {
        if state.devices.iter().any(|d| d.hardware_id == device) {
            Ok(())
        } else {
            Err(BusError::NotFound(format!("device {} is not attached", device)))
        }
    }

    fn latency(&self) -> Option<Duration> {
        self.state().register_latency
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusDriver for SimulatedBus {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut state = self.state();
        state.enumerations += 1;
        if let Some(err) = state.enumerate_failure.take() {
            return Err(err);
        }
        Ok(state.devices.clone())
    }

    fn read_register(&self, device: HardwareId, address: RegisterAddress) -> Result<u32> {
        if let Some(latency) = self.latency() {
            std::thread::sleep(latency);
        }
        let state = self.state();
        Self::check_present(&state, device)?;
        let raw = state.registers.get(&(device, address)).copied().unwrap_or(0);
        let value = match address {
            RegisterAddress::Phy(_) => raw & PHY_VALUE_MASK,
            RegisterAddress::Port(PortRegister::PortStatus) => PortStatus(raw).as_read().0,
            RegisterAddress::Port(PortRegister::LinkInfo) => raw & 0x00FF_FFFF,
        };
        Ok(value)
    }

    fn write_register(
        &self,
        device: HardwareId,
        address: RegisterAddress,
        value: u32,
    ) -> Result<()> {
        if let Some(latency) = self.latency() {
            std::thread::sleep(latency);
        }
        let mut state = self.state();
        Self::check_present(&state, device)?;
        state.registers.insert((device, address), value);
        Ok(())
    }

    fn fire_reset(&self, device: HardwareId) -> Result<()> {
        let mut state = self.state();
        if let Some(err) = state.reset_failure.take() {
            return Err(err);
        }
        Self::check_present(&state, device)?;
        state.resets.push(device);
        Ok(())
    }

    fn take_hotplug(&self) -> Option<mpsc::UnboundedReceiver<HotplugNotice>> {
        self.hotplug_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}
