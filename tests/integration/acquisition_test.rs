//! End-to-end acquisition through `SensorManager`.

use crate::support::{role_config, wait_for};
use pacewire::recording::{MemoryPersistence, ResetConfig, RoutedSample, RouterConfig};
use pacewire::sensors::gatt::{
    FTMS_CONTROL_POINT_UUID, HEART_RATE_MEASUREMENT_UUID, INDOOR_BIKE_DATA_UUID,
    RSC_MEASUREMENT_UUID, SC_CONTROL_POINT_UUID,
};
use pacewire::sensors::simulated::frames;
use pacewire::sensors::{
    AcquisitionConfig, ControlBehavior, SensorError, SensorEvent, SensorManager, SensorRole,
    SimulatedDevice, SimulatedTransport, Sport,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

fn config(sport: Sport, roles: &[(SensorRole, &str)]) -> AcquisitionConfig {
    AcquisitionConfig {
        sport,
        roles: roles
            .iter()
            .map(|(role, name)| role_config(*role, sport, name))
            .collect(),
        router: RouterConfig {
            sport,
            ..Default::default()
        },
        reset: ResetConfig {
            wait_for_link: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        },
        control_timeout: Duration::from_millis(100),
        erg_retry_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Collects events from the manager's channel as tests wait on them.
struct Events {
    rx: crossbeam::channel::Receiver<SensorEvent>,
    seen: Vec<SensorEvent>,
}

impl Events {
    fn new(manager: &SensorManager) -> Self {
        Self {
            rx: manager.event_receiver(),
            seen: Vec::new(),
        }
    }

    fn until(&mut self, mut condition: impl FnMut(&[SensorEvent]) -> bool) -> bool {
        wait_for(WAIT, || {
            self.seen.extend(self.rx.try_iter());
            condition(&self.seen)
        })
    }

    fn running_distances(&self) -> Vec<Option<f64>> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                SensorEvent::Sample(RoutedSample::Running(s)) => Some(s.distance_m),
                _ => None,
            })
            .collect()
    }
}

fn footpod_rig(control: ControlBehavior) -> (SimulatedTransport, SensorManager, MemoryPersistence) {
    let transport = SimulatedTransport::new();
    transport.add_device(SimulatedDevice::heart_rate("HR-1", "Polar H9"));
    transport.add_device(SimulatedDevice::footpod("FP-1", "Stryd").with_control(control));

    let store = MemoryPersistence::new();
    let mut manager = SensorManager::new(
        config(
            Sport::Running,
            &[(SensorRole::HeartRate, "polar"), (SensorRole::SpeedCadence, "stryd")],
        ),
        Arc::new(transport.clone()),
    );
    manager.start(Box::new(store.clone())).unwrap();
    assert!(wait_for(WAIT, || {
        transport.is_subscribed("HR-1", HEART_RATE_MEASUREMENT_UUID)
            && transport.is_subscribed("FP-1", RSC_MEASUREMENT_UUID)
    }));
    (transport, manager, store)
}

/// Commands need a running worker.
#[test]
fn test_commands_require_running_worker() {
    let manager = SensorManager::new(AcquisitionConfig::default(), Arc::new(SimulatedTransport::new()));
    assert!(!manager.is_running());
    assert!(matches!(manager.start_recording(), Err(SensorError::NotRunning)));
    assert!(matches!(manager.set_target_power(150), Err(SensorError::NotRunning)));
}

/// A rejected reset falls back to subtracting the first recorded distance.
#[test]
fn test_recording_with_baseline_fallback() {
    let (transport, mut manager, store) = footpod_rig(ControlBehavior::Reject);
    let mut events = Events::new(&manager);

    manager.start_recording().unwrap();
    assert!(events.until(|seen| seen
        .iter()
        .any(|e| matches!(e, SensorEvent::Info(m) if m.starts_with("Using distance baseline")))));
    assert_eq!(
        transport.writes("FP-1"),
        vec![(SC_CONTROL_POINT_UUID, vec![0x01, 0x00, 0x00, 0x00, 0x00])]
    );

    transport.notify("FP-1", RSC_MEASUREMENT_UUID, frames::rsc(3.1, 88, Some(1000.0)));
    transport.notify("HR-1", HEART_RATE_MEASUREMENT_UUID, frames::heart_rate(150));
    transport.notify("FP-1", RSC_MEASUREMENT_UUID, frames::rsc(3.2, 89, Some(1250.0)));
    assert!(events.until(|seen| seen
        .iter()
        .filter(|e| matches!(e, SensorEvent::Sample(RoutedSample::Running(_))))
        .count()
        == 2));
    assert_eq!(events.running_distances(), vec![Some(0.0), Some(250.0)]);

    manager.stop_recording().unwrap();
    assert!(events.until(|seen| seen
        .iter()
        .any(|e| matches!(e, SensorEvent::Recording(false)))));

    let activities = store.activities();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].samples.len(), 3);
    assert!(activities[0].ended);

    manager.shutdown();
    assert!(transport.connected_addresses().is_empty());
}

/// An acknowledged reset hands distance over to the device.
#[test]
fn test_recording_with_acknowledged_reset() {
    let (transport, mut manager, _store) = footpod_rig(ControlBehavior::Acknowledge);
    let mut events = Events::new(&manager);

    manager.start_recording().unwrap();
    assert!(wait_for(WAIT, || !transport.writes("FP-1").is_empty()));
    // let the router see the outcome before the first sample
    std::thread::sleep(Duration::from_millis(100));

    transport.notify("FP-1", RSC_MEASUREMENT_UUID, frames::rsc(3.0, 86, Some(4.0)));
    assert!(events.until(|seen| seen
        .iter()
        .any(|e| matches!(e, SensorEvent::Sample(RoutedSample::Running(_))))));
    assert_eq!(events.running_distances(), vec![Some(4.0)]);
    assert!(!events
        .seen
        .iter()
        .any(|e| matches!(e, SensorEvent::Info(m) if m.starts_with("Using distance baseline"))));

    manager.shutdown();
}

/// ERG targets are applied once, and again after the trainer reconnects.
#[test]
fn test_erg_target_reapplied_after_reconnect() {
    let transport = SimulatedTransport::new();
    transport.add_device(SimulatedDevice::trainer("TR-1", "KICKR CORE"));

    let mut manager = SensorManager::new(
        config(Sport::Cycling, &[(SensorRole::Trainer, "kickr")]),
        Arc::new(transport.clone()),
    );
    manager.start(Box::new(MemoryPersistence::new())).unwrap();
    manager.set_target_power(220).unwrap();

    let target = vec![0x05, 220, 0x00];
    let target_writes = |transport: &SimulatedTransport| {
        transport
            .writes("TR-1")
            .iter()
            .filter(|(uuid, payload)| *uuid == FTMS_CONTROL_POINT_UUID && *payload == target)
            .count()
    };

    assert!(wait_for(WAIT, || target_writes(&transport) == 1));
    // settled: nothing is re-sent while the target stays applied
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(target_writes(&transport), 1);

    transport.drop_link("TR-1", "trainer powered off");
    assert!(wait_for(WAIT, || target_writes(&transport) == 2));

    // trainer data still flows after the reconnect
    let mut events = Events::new(&manager);
    assert!(wait_for(WAIT, || transport.is_subscribed("TR-1", INDOOR_BIKE_DATA_UUID)));
    transport.notify("TR-1", INDOOR_BIKE_DATA_UUID, frames::indoor_bike(30.0, 88.0, 2000, 221));
    assert!(events.until(|seen| seen.iter().any(|e| matches!(
        e,
        SensorEvent::Sample(RoutedSample::Cycling(s)) if s.sample.power_w == Some(221)
    ))));

    manager.clear_target_power().unwrap();
    manager.shutdown();
    assert!(!transport.is_connected("TR-1"));
}

/// Shutdown closes an open recording and every link.
#[test]
fn test_shutdown_closes_recording() {
    let (transport, mut manager, store) = footpod_rig(ControlBehavior::Silent);

    manager.start_recording().unwrap();
    assert!(wait_for(WAIT, || store.activities().len() == 1));

    manager.shutdown();
    assert!(!manager.is_running());
    assert!(store.activities()[0].ended);
    assert!(transport.connected_addresses().is_empty());
}
