//! The bus manager instance
//!
//! Each [`BusManager`] owns its own enumeration cache, identity arena and
//! event dispatcher, so several managers (or tests) can run side by side.
//! Lookups read the published snapshot without waiting; anything that
//! reaches hardware or the network is async and bounded by a timeout.

use cambus_core::{
    BusDriver, BusError, CameraInfo, DeviceIdentity, IdentityArena, InterfaceType, IpConfig,
    MacAddress, Result, TopologyNode,
};
use cambus_discovery::{AssignmentReport, GigeNetwork, IpAssignment};
use cambus_gige::GvcpLink;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::control::watch_hotplug;
use crate::events::{BusEvent, BusEventKind, CallbackHandle, EventCenter};
use crate::resolver::Snapshot;

/// State shared between the manager handle and its hot-plug watcher
pub(crate) struct Shared {
    pub(crate) driver: Arc<dyn BusDriver>,
    pub(crate) config: ManagerConfig,
    pub(crate) snapshot: RwLock<Arc<Snapshot>>,
    /// Held for the whole of a rebuild; serializes rescans and resets
    pub(crate) arena: tokio::sync::Mutex<IdentityArena>,
    pub(crate) events: EventCenter,
}

pub struct BusManager {
    pub(crate) shared: Arc<Shared>,
    watcher: Option<JoinHandle<()>>,
}

impl BusManager {
    /// Enumerate every bus once and start event dispatch. Must be called
    /// inside a tokio runtime.
    pub async fn new(driver: Arc<dyn BusDriver>, config: ManagerConfig) -> Result<Self> {
        let hotplug = if config.watch_hotplug {
            driver.take_hotplug()
        } else {
            None
        };

        let shared = Arc::new(Shared {
            driver,
            events: EventCenter::new(config.event_queue_capacity),
            config,
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            arena: tokio::sync::Mutex::new(IdentityArena::new()),
        });
        shared.rebuild(false).await?;
        // Arrivals from the first scan have no subscribers yet
        shared.events.flush().await?;

        let watcher = hotplug.map(|rx| {
            debug!("Watching transport hot-plug notices");
            tokio::spawn(watch_hotplug(Arc::downgrade(&shared), rx))
        });

        let snapshot = shared.current();
        info!(
            devices = snapshot.num_devices(),
            cameras = snapshot.num_cameras(),
            "Bus manager ready"
        );
        Ok(Self { shared, watcher })
    }

    /// The current enumeration. Holding it gives a consistent view across
    /// several lookups even if a rescan publishes a newer one meanwhile.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.shared.current()
    }

    pub fn num_cameras(&self) -> usize {
        self.snapshot().num_cameras()
    }

    pub fn num_devices(&self) -> usize {
        self.snapshot().num_devices()
    }

    pub fn camera_from_index(&self, index: usize) -> Result<DeviceIdentity> {
        self.snapshot().camera_from_index(index)
    }

    pub fn device_from_index(&self, index: usize) -> Result<DeviceIdentity> {
        self.snapshot().device_from_index(index)
    }

    pub fn camera_serial_from_index(&self, index: usize) -> Result<u32> {
        self.snapshot().camera_serial_from_index(index)
    }

    pub fn camera_from_serial(&self, serial_number: u32) -> Result<DeviceIdentity> {
        self.snapshot().camera_from_serial(serial_number)
    }

    pub fn camera_from_ip(&self, ip: Ipv4Addr) -> Result<DeviceIdentity> {
        self.snapshot().camera_from_ip(ip)
    }

    pub fn interface_type(&self, identity: DeviceIdentity) -> Result<InterfaceType> {
        self.snapshot().interface_type(identity)
    }

    pub fn serial_number(&self, identity: DeviceIdentity) -> Result<u32> {
        self.snapshot().serial_number(identity)
    }

    pub fn topology(&self) -> Arc<TopologyNode> {
        self.snapshot().topology()
    }

    /// Subscribe to one category of bus events. The callback runs on the
    /// dispatch task and delays later events for as long as it runs.
    pub fn register_callback<F>(&self, kind: BusEventKind, callback: F) -> CallbackHandle
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.shared.events.register(kind, callback)
    }

    /// Returns once no invocation of the callback is running or can start
    pub async fn unregister_callback(&self, handle: CallbackHandle) -> Result<()> {
        self.shared.events.unregister(handle).await
    }

    /// Wait until every event produced so far has been delivered
    pub async fn flush_events(&self) -> Result<()> {
        self.shared.events.flush().await
    }

    /// Discover GigE cameras reachable from `network`, tagging each with
    /// its identity when it is part of the current enumeration
    pub async fn discover_gige_cameras<L: GvcpLink>(
        &self,
        network: &GigeNetwork<L>,
        capacity: usize,
    ) -> Result<Vec<CameraInfo>> {
        let mut cameras = network.discover(capacity).await?;
        let snapshot = self.snapshot();
        for camera in &mut cameras {
            camera.identity = snapshot
                .devices()
                .find(|(_, d)| {
                    d.interface == InterfaceType::Network
                        && (d.mac == Some(camera.mac) || d.ip == Some(camera.ip_config.address))
                })
                .map(|(identity, _)| identity);
        }
        Ok(cameras)
    }

    pub async fn force_ip_address<L: GvcpLink>(
        &self,
        network: &GigeNetwork<L>,
        mac: MacAddress,
        address: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        network
            .force_ip(mac, IpConfig::new(address, subnet_mask, gateway))
            .await
    }

    pub async fn auto_assign_all_ip_addresses<L: GvcpLink>(
        &self,
        network: &GigeNetwork<L>,
    ) -> Result<AssignmentReport> {
        network.auto_assign_all().await
    }

    pub async fn auto_assign_ip_address<L: GvcpLink>(
        &self,
        network: &GigeNetwork<L>,
        serial_number: u32,
    ) -> Result<Option<IpAssignment>> {
        network.auto_assign(serial_number).await
    }

    /// Whether another application already controls the camera. Only
    /// network cameras can be held by someone else.
    pub async fn is_camera_controllable<L: GvcpLink>(
        &self,
        network: &GigeNetwork<L>,
        identity: DeviceIdentity,
    ) -> Result<bool> {
        let device = self.snapshot().descriptor(identity)?.clone();
        if device.interface != InterfaceType::Network {
            return Ok(true);
        }
        let ip = device.ip.ok_or_else(|| {
            BusError::NotFound(format!("network device {} has no address", identity))
        })?;
        network.is_controllable(ip).await
    }
}

impl Drop for BusManager {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Shared {
    pub(crate) fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn publish_snapshot(&self, snapshot: Snapshot) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(snapshot);
    }
}
