//! Bus manager behaviour against the simulated bus

use cambus::{
    BusError, BusEvent, BusEventKind, BusManager, DeviceDescriptor, HardwareId, InterfaceType,
    MacAddress, ManagerConfig, SimulatedBus,
};
use cambus_core::register::{PhyAddress, PortRegister, RegisterAddress};
use cambus_core::NodeKind;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

const GIGE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 20);

fn rig() -> Vec<DeviceDescriptor> {
    vec![
        DeviceDescriptor::controller(1, InterfaceType::Usb),
        DeviceDescriptor::hub(2, InterfaceType::Usb).under(1, 1),
        DeviceDescriptor::camera(3, InterfaceType::Usb, 300).under(2, 1),
        DeviceDescriptor::camera(4, InterfaceType::Usb, 400).under(2, 2),
        DeviceDescriptor::controller(10, InterfaceType::SerialBus),
        DeviceDescriptor::camera(11, InterfaceType::SerialBus, 1100).under(10, 0),
        DeviceDescriptor::camera(20, InterfaceType::Network, 2000)
            .with_network(MacAddress([0, 0xb0, 0x9d, 0, 0, 20]), GIGE_IP),
    ]
}

fn quiet_config() -> ManagerConfig {
    ManagerConfig {
        watch_hotplug: false,
        ..Default::default()
    }
}

async fn start(config: ManagerConfig) -> (Arc<SimulatedBus>, BusManager) {
    let bus = Arc::new(SimulatedBus::with_devices(rig()));
    let manager = BusManager::new(bus.clone(), config).await.unwrap();
    (bus, manager)
}

#[tokio::test]
async fn test_index_resolution_is_distinct_and_bounded() {
    let (_bus, manager) = start(quiet_config()).await;

    assert_eq!(manager.num_devices(), 7);
    assert_eq!(manager.num_cameras(), 4);

    let ids: HashSet<_> = (0..manager.num_devices())
        .map(|i| manager.device_from_index(i).unwrap())
        .collect();
    assert_eq!(ids.len(), manager.num_devices());

    assert!(matches!(
        manager.device_from_index(manager.num_devices()),
        Err(BusError::NotFound(_))
    ));
    assert!(matches!(
        manager.camera_from_index(manager.num_cameras()),
        Err(BusError::NotFound(_))
    ));

    let serials: Vec<u32> = (0..manager.num_cameras())
        .map(|i| manager.camera_serial_from_index(i).unwrap())
        .collect();
    assert_eq!(serials, vec![300, 400, 1100, 2000]);
}

#[tokio::test]
async fn test_reverse_lookups() {
    let (_bus, manager) = start(quiet_config()).await;

    let usb = manager.camera_from_serial(400).unwrap();
    assert_eq!(manager.interface_type(usb).unwrap(), InterfaceType::Usb);
    assert_eq!(manager.serial_number(usb).unwrap(), 400);

    let gige = manager.camera_from_ip(GIGE_IP).unwrap();
    assert_eq!(gige, manager.camera_from_serial(2000).unwrap());
    assert_eq!(manager.interface_type(gige).unwrap(), InterfaceType::Network);
    assert!(matches!(
        manager.camera_from_ip(Ipv4Addr::new(192, 168, 10, 99)),
        Err(BusError::NotFound(_))
    ));

    let hub = manager.device_from_index(1).unwrap();
    assert!(matches!(manager.serial_number(hub), Err(BusError::NotFound(_))));
}

#[tokio::test]
async fn test_topology_follows_port_order() {
    let (_bus, manager) = start(quiet_config()).await;
    let root = manager.topology();

    assert!(root.is_root());
    let top: Vec<_> = root.children().iter().map(|n| n.hardware_id()).collect();
    assert_eq!(
        top,
        vec![Some(HardwareId(1)), Some(HardwareId(10)), Some(HardwareId(20))]
    );

    let hub = &root.children()[0].children()[0];
    assert_eq!(hub.kind(), NodeKind::Hub);
    let cameras: Vec<_> = hub.children().iter().map(|n| n.serial_number()).collect();
    assert_eq!(cameras, vec![Some(300), Some(400)]);
    let parent = hub.children()[1].parent().unwrap();
    assert_eq!(parent.hardware_id(), Some(HardwareId(2)));

    let id = manager.camera_from_serial(1100).unwrap();
    let node = root.find(id).unwrap();
    assert_eq!(node.parent().unwrap().hardware_id(), Some(HardwareId(10)));
}

#[tokio::test]
async fn test_rescan_without_change_keeps_identities() {
    let (bus, manager) = start(quiet_config()).await;
    let before: Vec<_> = (0..manager.num_devices())
        .map(|i| manager.device_from_index(i).unwrap())
        .collect();

    manager.rescan_bus().await.unwrap();
    manager.rescan_bus().await.unwrap();

    let after: Vec<_> = (0..manager.num_devices())
        .map(|i| manager.device_from_index(i).unwrap())
        .collect();
    assert_eq!(before, after);
    assert_eq!(manager.serial_number(before[2]).unwrap(), 300);
    assert_eq!(bus.enumeration_count(), 3);
}

#[tokio::test]
async fn test_rescan_invalidates_only_removed_devices() {
    let (bus, manager) = start(quiet_config()).await;
    let kept = manager.camera_from_serial(300).unwrap();
    let gone = manager.camera_from_serial(400).unwrap();

    bus.remove(HardwareId(4));
    manager.rescan_bus().await.unwrap();

    assert_eq!(manager.camera_from_serial(300).unwrap(), kept);
    assert_eq!(manager.serial_number(gone), Err(BusError::StaleIdentity(gone)));
    assert_eq!(manager.num_cameras(), 3);
}

#[tokio::test]
async fn test_arrival_delivered_once_before_reset() {
    let (bus, manager) = start(quiet_config()).await;
    let log = Arc::new(Mutex::new(Vec::new()));

    for kind in [BusEventKind::Arrival, BusEventKind::BusReset] {
        let log = log.clone();
        manager.register_callback(kind, move |event| log.lock().unwrap().push(*event));
    }

    bus.insert(DeviceDescriptor::camera(5, InterfaceType::Usb, 500).under(2, 3));
    manager.rescan_bus().await.unwrap();
    let target = manager.camera_from_serial(300).unwrap();
    manager.fire_bus_reset(target).await.unwrap();
    manager.flush_events().await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![BusEvent::Arrival { serial_number: 500 }, BusEvent::BusReset]
    );
    assert_eq!(bus.resets(), vec![HardwareId(3)]);
}

#[tokio::test]
async fn test_reset_makes_held_identities_stale() {
    let (_bus, manager) = start(quiet_config()).await;
    let old = manager.camera_from_serial(1100).unwrap();

    manager.fire_bus_reset(old).await.unwrap();

    assert_eq!(manager.serial_number(old), Err(BusError::StaleIdentity(old)));
    let phy = RegisterAddress::Phy(PhyAddress::new(0, 0, 1).unwrap());
    assert_eq!(
        manager.read_register(old, phy).await,
        Err(BusError::StaleIdentity(old))
    );
    let new = manager.camera_from_serial(1100).unwrap();
    assert_ne!(new, old);
    assert_eq!(manager.serial_number(new).unwrap(), 1100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregister_waits_for_in_flight_callback() {
    let (bus, manager) = start(quiet_config()).await;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    let handle = {
        let (started, finished, calls) = (started.clone(), finished.clone(), calls.clone());
        manager.register_callback(BusEventKind::Arrival, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            started.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            finished.store(true, Ordering::SeqCst);
        })
    };

    bus.insert(DeviceDescriptor::camera(5, InterfaceType::Usb, 500));
    manager.rescan_bus().await.unwrap();
    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    manager.unregister_callback(handle).await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    for i in 0..100u32 {
        bus.insert(DeviceDescriptor::camera(1000 + i as u64, InterfaceType::Usb, 5000 + i));
        manager.rescan_bus().await.unwrap();
    }
    manager.flush_events().await.unwrap();

    assert_eq!(manager.num_cameras(), 105);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        manager.unregister_callback(handle).await,
        Err(BusError::InvalidParameter(_))
    ));
}

#[tokio::test]
async fn test_hotplug_notices_trigger_rescan() {
    let (bus, manager) = start(ManagerConfig::default()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for kind in [
        BusEventKind::Arrival,
        BusEventKind::Removal,
        BusEventKind::BusReset,
    ] {
        let tx = tx.clone();
        manager.register_callback(kind, move |event| {
            let _ = tx.send(*event);
        });
    }

    let wait = Duration::from_secs(2);

    bus.attach(DeviceDescriptor::camera(6, InterfaceType::Usb, 600).under(2, 4));
    let event = tokio::time::timeout(wait, rx.recv()).await.unwrap();
    assert_eq!(event, Some(BusEvent::Arrival { serial_number: 600 }));
    let id = manager.camera_from_serial(600).unwrap();

    bus.detach(HardwareId(6));
    let event = tokio::time::timeout(wait, rx.recv()).await.unwrap();
    assert_eq!(event, Some(BusEvent::Removal { serial_number: 600 }));
    assert_eq!(manager.serial_number(id), Err(BusError::StaleIdentity(id)));

    let held = manager.camera_from_serial(300).unwrap();
    bus.external_reset();
    let event = tokio::time::timeout(wait, rx.recv()).await.unwrap();
    assert_eq!(event, Some(BusEvent::BusReset));
    assert_ne!(manager.camera_from_serial(300).unwrap(), held);
}

#[tokio::test]
async fn test_events_see_the_snapshot_they_announce() {
    let (bus, manager) = start(quiet_config()).await;
    let manager = Arc::new(manager);
    let handle: Arc<OnceLock<Weak<BusManager>>> = Arc::new(OnceLock::new());
    let _ = handle.set(Arc::downgrade(&manager));
    let seen = Arc::new(Mutex::new(Vec::new()));

    for kind in [BusEventKind::Arrival, BusEventKind::Removal] {
        let handle = handle.clone();
        let seen = seen.clone();
        manager.register_callback(kind, move |event| {
            let Some(manager) = handle.get().and_then(Weak::upgrade) else {
                return;
            };
            let Some(serial) = event.serial_number() else {
                return;
            };
            let found = manager.camera_from_serial(serial).is_ok();
            seen.lock().unwrap().push((*event, found));
        });
    }

    for round in 0..5u32 {
        let serial = 700 + round;
        bus.insert(DeviceDescriptor::camera(30 + round as u64, InterfaceType::Usb, serial));
        manager.rescan_bus().await.unwrap();
        manager.flush_events().await.unwrap();
        bus.remove(HardwareId(30 + round as u64));
        manager.rescan_bus().await.unwrap();
        manager.flush_events().await.unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 10);
    for (event, found) in seen.iter() {
        match event {
            // Arrivals resolve, removals no longer do
            BusEvent::Arrival { .. } => assert!(found, "{:?} not yet visible", event),
            BusEvent::Removal { .. } => assert!(!found, "{:?} still visible", event),
            BusEvent::BusReset => unreachable!(),
        }
    }
}

#[tokio::test]
async fn test_register_round_trip() {
    let (_bus, manager) = start(quiet_config()).await;

    let serial_bus = manager.camera_from_serial(1100).unwrap();
    manager
        .write_phy_register(serial_bus, 1, 2, 3, 0xA5)
        .await
        .unwrap();
    assert_eq!(
        manager.read_phy_register(serial_bus, 1, 2, 3).await.unwrap(),
        0xA5
    );

    let usb = manager.camera_from_serial(300).unwrap();
    let status = RegisterAddress::Port(PortRegister::PortStatus);
    manager.write_register(usb, status, 0x0000_0203).await.unwrap();
    assert_eq!(manager.read_register(usb, status).await.unwrap(), 0x0000_0203);

    let decoded = manager.usb_port_status(usb).await.unwrap();
    assert!(decoded.connected());
    assert!(decoded.enabled());
    assert!(decoded.powered());
}

#[tokio::test]
async fn test_port_words_read_through_raw() {
    let (bus, manager) = start(quiet_config()).await;
    let usb = manager.camera_from_serial(400).unwrap();

    bus.set_register(
        HardwareId(4),
        RegisterAddress::Port(PortRegister::LinkInfo),
        0x0032_0007,
    );
    let link = manager.usb_link_info(usb).await.unwrap();
    assert_eq!(link.link_error_count(), 7);
    assert_eq!(link.rx_lane_count(), 2);
    assert_eq!(link.tx_lane_count(), 3);

    // Warm reset request always reads back as zero
    bus.set_register(
        HardwareId(4),
        RegisterAddress::Port(PortRegister::PortStatus),
        0x8000_0001,
    );
    let status = manager.usb_port_status(usb).await.unwrap();
    assert_eq!(status.0, 0x0000_0001);
    assert!(!status.warm_reset_requested());
}

#[tokio::test]
async fn test_register_access_respects_capabilities() {
    let (_bus, manager) = start(quiet_config()).await;
    let usb = manager.camera_from_serial(300).unwrap();
    let serial_bus = manager.camera_from_serial(1100).unwrap();
    let gige = manager.camera_from_serial(2000).unwrap();

    assert!(matches!(
        manager.read_phy_register(usb, 0, 0, 0).await,
        Err(BusError::NotSupported { .. })
    ));
    assert!(matches!(
        manager.usb_port_status(serial_bus).await,
        Err(BusError::NotSupported { .. })
    ));
    assert!(matches!(
        manager.usb_link_info(gige).await,
        Err(BusError::NotSupported {
            interface: InterfaceType::Network,
            ..
        })
    ));
    assert!(matches!(
        manager
            .write_register(usb, RegisterAddress::Port(PortRegister::LinkInfo), 1)
            .await,
        Err(BusError::NotSupported { .. })
    ));
    assert!(matches!(
        manager.read_phy_register(serial_bus, 8, 0, 0).await,
        Err(BusError::InvalidParameter(_))
    ));
    assert!(matches!(
        manager.write_phy_register(serial_bus, 0, 0, 0, 0x100).await,
        Err(BusError::InvalidParameter(_))
    ));
}

#[tokio::test]
async fn test_slow_register_times_out() {
    let config = ManagerConfig {
        register_timeout_ms: 50,
        ..quiet_config()
    };
    let (bus, manager) = start(config).await;
    let id = manager.camera_from_serial(1100).unwrap();

    bus.set_register_latency(Some(Duration::from_millis(300)));
    let err = manager.read_phy_register(id, 0, 0, 0).await.unwrap_err();
    assert_eq!(err, BusError::Timeout(Duration::from_millis(50)));
    assert!(err.is_retryable());

    bus.set_register_latency(None);
    assert_eq!(manager.read_phy_register(id, 0, 0, 0).await.unwrap(), 0);
}
