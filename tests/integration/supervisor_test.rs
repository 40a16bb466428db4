//! Link supervisor behavior against the simulated transport.

use crate::support::{eventually, role_config, Rig};
use pacewire::recording::RouterInput;
use pacewire::sensors::gatt::{
    CYCLING_POWER_MEASUREMENT_UUID, HEART_RATE_MEASUREMENT_UUID, RSC_MEASUREMENT_UUID,
};
use pacewire::sensors::simulated::frames;
use pacewire::sensors::{
    DataChannel, LinkState, SensorEvent, SensorRole, SimulatedDevice, SimulatedTransport, Sport,
    SupervisorConfig, TransportError,
};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

fn states(events: &[SensorEvent], role: SensorRole) -> Vec<LinkState> {
    events
        .iter()
        .filter_map(|event| match event {
            SensorEvent::State { role: r, state } if *r == role => Some(*state),
            _ => None,
        })
        .collect()
}

fn errors(events: &[SensorEvent], role: SensorRole) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SensorEvent::Error {
                role: Some(r),
                message,
            } if *r == role => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Index of `needle` in `haystack`, as a contiguous run.
fn find_run(haystack: &[LinkState], needle: &[LinkState]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Streaming resumes on its own after the device drops the link.
#[tokio::test]
async fn test_reconnects_after_disconnect() {
    let transport = SimulatedTransport::new();
    transport.add_device(SimulatedDevice::heart_rate("HR-1", "Polar H10 1234"));

    let mut rig = Rig::new(transport.clone(), Sport::Running, &[SensorRole::HeartRate]);
    rig.spawn(role_config(SensorRole::HeartRate, Sport::Running, "polar"));

    assert!(eventually(WAIT, || transport.is_subscribed("HR-1", HEART_RATE_MEASUREMENT_UUID)).await);
    assert!(rig.fusion.is_connected(SensorRole::HeartRate));

    assert!(transport.notify("HR-1", HEART_RATE_MEASUREMENT_UUID, frames::heart_rate(141)));
    let input = tokio::time::timeout(WAIT, rig.router.recv()).await.unwrap();
    assert!(matches!(input, Some(RouterInput::HeartRate(ref s)) if s.bpm == 141));

    assert!(transport.drop_link("HR-1", "link supervision timeout"));
    assert!(eventually(WAIT, || transport.stats().connects >= 2).await);
    assert!(eventually(WAIT, || transport.is_subscribed("HR-1", HEART_RATE_MEASUREMENT_UUID)).await);

    let events = rig.drain_events();
    let seen = states(&events, SensorRole::HeartRate);
    assert!(find_run(
        &seen,
        &[
            LinkState::Streaming,
            LinkState::Disconnected,
            LinkState::Backoff,
            LinkState::ResolvingAddress,
        ]
    )
    .is_some());
    assert!(errors(&events, SensorRole::HeartRate)
        .iter()
        .any(|m| m == "Heart Rate sensor disconnected: link supervision timeout"));

    // a cached address skips the second scan
    assert_eq!(transport.stats().scans, 1);

    assert!(transport.notify("HR-1", HEART_RATE_MEASUREMENT_UUID, frames::heart_rate(143)));
    let input = tokio::time::timeout(WAIT, rig.router.recv()).await.unwrap();
    assert!(matches!(input, Some(RouterInput::HeartRate(ref s)) if s.bpm == 143));

    rig.shutdown().await;
    assert!(!transport.is_connected("HR-1"));
}

/// A sensor that never shows up does not hold back the others.
#[tokio::test]
async fn test_missing_sensor_does_not_block_others() {
    let transport = SimulatedTransport::new();
    transport.add_device(SimulatedDevice::heart_rate("HR-1", "HRM-Pro"));
    transport.add_device(SimulatedDevice::footpod("FP-1", "Stryd"));

    let mut rig = Rig::new(
        transport.clone(),
        Sport::Running,
        &[SensorRole::HeartRate, SensorRole::SpeedCadence, SensorRole::Power],
    );
    rig.spawn(role_config(SensorRole::HeartRate, Sport::Running, "hrm"));
    rig.spawn(role_config(SensorRole::SpeedCadence, Sport::Running, "stryd"));
    rig.spawn(role_config(SensorRole::Power, Sport::Running, "Assioma"));

    assert!(eventually(WAIT, || {
        rig.fusion.is_connected(SensorRole::HeartRate)
            && rig.fusion.is_connected(SensorRole::SpeedCadence)
    })
    .await);
    // footpod power rides along on the speed/cadence link
    assert!(rig
        .fusion
        .link_status(SensorRole::SpeedCadence, DataChannel::Power)
        .connected);
    assert!(transport.is_subscribed("FP-1", CYCLING_POWER_MEASUREMENT_UUID));

    let mut seen = Vec::new();
    assert!(eventually(WAIT, || {
        seen.extend(rig.events.try_iter());
        errors(&seen, SensorRole::Power)
            .iter()
            .any(|m| m == "Power sensor 'Assioma' not found")
    })
    .await);
    assert!(!rig.fusion.is_connected(SensorRole::Power));

    rig.shutdown().await;
}

/// Scans, probes and connects never overlap across roles.
#[tokio::test]
async fn test_gate_serializes_adapter_operations() {
    let transport = SimulatedTransport::new().with_op_delay(Duration::from_millis(15));
    transport.add_device(SimulatedDevice::heart_rate("HR-1", "HR one"));
    transport.add_device(SimulatedDevice::power_meter("PM-1", "Power one"));
    transport.add_device(SimulatedDevice::trainer("TR-1", "Trainer one"));

    let roles = [SensorRole::HeartRate, SensorRole::Power, SensorRole::Trainer];
    let mut rig = Rig::new(transport.clone(), Sport::Cycling, &roles);
    rig.spawn(role_config(SensorRole::HeartRate, Sport::Cycling, "hr one"));
    rig.spawn(role_config(SensorRole::Power, Sport::Cycling, "power one"));
    rig.spawn(role_config(SensorRole::Trainer, Sport::Cycling, "trainer one"));

    assert!(eventually(WAIT, || transport.connected_addresses().len() == 3).await);
    let stats = transport.stats();
    assert_eq!(stats.max_concurrent_ops, 1);
    assert_eq!(stats.scans, 3);

    rig.shutdown().await;
    assert!(transport.connected_addresses().is_empty());
}

/// A busy adapter is retried quietly a bounded number of times.
#[tokio::test]
async fn test_busy_adapter_retry_limit() {
    let transport = SimulatedTransport::new();
    transport.add_device(SimulatedDevice::power_meter("PM-1", "Favero"));
    for _ in 0..3 {
        transport.fail_next_connect("PM-1", TransportError::InProgress("InProgress".into()));
    }

    let mut rig = Rig::new(transport.clone(), Sport::Cycling, &[SensorRole::Power]);
    rig.spawn(role_config(SensorRole::Power, Sport::Cycling, "favero"));

    assert!(eventually(WAIT, || rig.fusion.is_connected(SensorRole::Power)).await);
    assert_eq!(transport.stats().connects, 4);
    assert!(errors(&rig.drain_events(), SensorRole::Power).is_empty());
    rig.shutdown().await;

    let transport = SimulatedTransport::new();
    transport.add_device(SimulatedDevice::power_meter("PM-2", "Favero"));
    for _ in 0..7 {
        transport.fail_next_connect("PM-2", TransportError::InProgress("InProgress".into()));
    }
    let mut rig = Rig::new(transport.clone(), Sport::Cycling, &[SensorRole::Power]);
    rig.spawn(role_config(SensorRole::Power, Sport::Cycling, "favero"));

    assert!(eventually(WAIT, || rig.fusion.is_connected(SensorRole::Power)).await);
    let events = rig.drain_events();
    assert!(states(&events, SensorRole::Power).contains(&LinkState::Error));
    assert_eq!(errors(&events, SensorRole::Power).len(), 1);
    rig.shutdown().await;
}

/// Stopping while one role connects and another waits for the adapter
/// returns within one backoff interval; the abandoned attempt closes its
/// link once it completes.
#[tokio::test]
async fn test_stop_during_connect_is_prompt() {
    let transport = SimulatedTransport::new().with_op_delay(Duration::from_millis(300));
    transport.add_device(SimulatedDevice::heart_rate("HR-1", "Polar H10"));
    transport.add_device(SimulatedDevice::power_meter("PM-1", "Assioma Duo"));

    let roles = [SensorRole::HeartRate, SensorRole::Power];
    let backoff = Duration::from_millis(200);
    let mut rig = Rig::new(transport.clone(), Sport::Cycling, &roles);
    for (role, name) in [(SensorRole::HeartRate, "polar"), (SensorRole::Power, "assioma")] {
        let mut config = role_config(role, Sport::Cycling, name);
        config.timing.backoff = backoff;
        config.timing.connect_timeout = Duration::from_secs(2);
        rig.spawn(config);
    }

    let mut seen = Vec::new();
    assert!(eventually(WAIT, || {
        seen.extend(rig.events.try_iter());
        roles
            .iter()
            .any(|role| states(&seen, *role).contains(&LinkState::Connecting))
    })
    .await);

    let gate = rig.gate.clone();
    let started = Instant::now();
    rig.shutdown().await;
    assert!(started.elapsed() < backoff);

    gate.settle().await;
    assert!(transport.connected_addresses().is_empty());
    assert!(transport.stats().connects <= 1);
}

/// A known address is probed until the device comes into range.
#[tokio::test]
async fn test_waits_for_visibility() {
    let transport = SimulatedTransport::new();
    transport.add_device(SimulatedDevice::cadence_pod("FP-9", "Milestone").hidden());

    let mut rig = Rig::new(transport.clone(), Sport::Running, &[SensorRole::SpeedCadence]);
    rig.spawn(SupervisorConfig {
        address: Some("FP-9".to_string()),
        name: None,
        ..role_config(SensorRole::SpeedCadence, Sport::Running, "")
    });

    assert!(eventually(WAIT, || transport.stats().probes >= 3).await);
    assert_eq!(transport.stats().connects, 0);
    assert_eq!(transport.stats().scans, 0);

    transport.set_visible("FP-9", true);
    assert!(eventually(WAIT, || transport.is_subscribed("FP-9", RSC_MEASUREMENT_UUID)).await);

    assert!(transport.notify("FP-9", RSC_MEASUREMENT_UUID, frames::rsc(2.8, 86, Some(15.0))));
    let input = tokio::time::timeout(WAIT, rig.router.recv()).await.unwrap();
    match input {
        Some(RouterInput::Fused(sample)) => assert_eq!(sample.total_distance_m(), Some(15.0)),
        other => panic!("unexpected {:?}", other),
    }

    rig.shutdown().await;
}

/// An unconfigured role reports and exits without touching the adapter.
#[tokio::test]
async fn test_unconfigured_role_exits() {
    let transport = SimulatedTransport::new();
    let mut rig = Rig::new(transport.clone(), Sport::Running, &[SensorRole::Cadence]);
    rig.spawn(SupervisorConfig::new(SensorRole::Cadence));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = rig.drain_events();
    assert_eq!(errors(&events, SensorRole::Cadence).len(), 1);
    assert_eq!(transport.stats().scans, 0);
    rig.shutdown().await;
}
