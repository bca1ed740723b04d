//! Rescans, bus resets and hot-plug handling

use cambus_core::{BusDriver, BusError, DeviceIdentity, HotplugNotice, Result};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::manager::{BusManager, Shared};
use crate::resolver::reconcile;

impl Shared {
    /// Run a driver call on the blocking pool, giving up after `limit`
    pub(crate) async fn call_driver<T, F>(&self, limit: Duration, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn BusDriver) -> Result<T> + Send + 'static,
    {
        let driver = self.driver.clone();
        let task = tokio::task::spawn_blocking(move || op(driver.as_ref()));
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(BusError::Generic(format!("driver call aborted: {}", e))),
            Err(_) => Err(BusError::Timeout(limit)),
        }
    }

    /// Enumerate, publish the new snapshot, then queue the events it
    /// implies. The arena lock is held throughout so events from two
    /// rebuilds never interleave.
    pub(crate) async fn rebuild(&self, reset: bool) -> Result<()> {
        let mut arena = self.arena.lock().await;

        let devices = self
            .call_driver(self.config.enumerate_timeout(), |driver| driver.enumerate())
            .await
            .map_err(|e| bus_master_failure("enumeration", e))?;

        let previous = self.current();
        let (snapshot, events) = reconcile(&mut arena, &previous, devices, reset);
        let epoch = snapshot.epoch();
        let devices = snapshot.num_devices();
        self.publish_snapshot(snapshot);

        info!(
            epoch = epoch,
            devices = devices,
            events = events.len(),
            reset = reset,
            "Published bus snapshot"
        );

        for event in events {
            self.events.publish(event).await?;
        }
        Ok(())
    }
}

/// Timeouts stay timeouts; anything else means the bus could not be driven
fn bus_master_failure(stage: &str, err: BusError) -> BusError {
    match err {
        BusError::Timeout(_) => err,
        other => BusError::BusMasterFailed(format!("{} failed: {}", stage, other)),
    }
}

impl BusManager {
    /// Re-enumerate without resetting. Identities survive unless their
    /// device is gone.
    pub async fn rescan_bus(&self) -> Result<()> {
        self.shared.rebuild(false).await
    }

    /// Reset the bus segment holding `identity`. Every identity issued so
    /// far is retired; callers must resolve again once this returns.
    pub async fn fire_bus_reset(&self, identity: DeviceIdentity) -> Result<()> {
        let device = self.snapshot().descriptor(identity)?.clone();
        if !device.interface.capabilities().bus_reset {
            return Err(BusError::not_supported(device.interface, "bus reset"));
        }

        let hardware_id = device.hardware_id;
        self.shared
            .call_driver(self.shared.config.reset_timeout(), move |driver| {
                driver.fire_reset(hardware_id)
            })
            .await
            .map_err(|e| bus_master_failure("bus reset", e))?;

        info!(device = %hardware_id, interface = %device.interface, "Bus reset issued");
        self.shared.rebuild(true).await
    }
}

/// Turn transport hot-plug notices into rescans. Bursts of notices are
/// coalesced into one rebuild; a reported reset retires every identity.
pub(crate) async fn watch_hotplug(
    shared: Weak<Shared>,
    mut notices: mpsc::UnboundedReceiver<HotplugNotice>,
) {
    while let Some(first) = notices.recv().await {
        let mut reset = first == HotplugNotice::Reset;
        let mut coalesced = 1;
        while let Ok(next) = notices.try_recv() {
            reset |= next == HotplugNotice::Reset;
            coalesced += 1;
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        debug!(notices = coalesced, reset = reset, "Hot-plug activity, rescanning");
        if let Err(e) = shared.rebuild(reset).await {
            warn!(error = %e, "Rescan after hot-plug notice failed");
        }
    }
    debug!("Hot-plug watcher stopped");
}
