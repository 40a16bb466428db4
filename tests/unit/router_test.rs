//! Unit tests for the sample router.

use pacewire::recording::{
    FusedSample, MemoryPersistence, RecordingStatus, RouterConfig, RouterInput, RoutedSample,
    SampleRouter,
};
use pacewire::sensors::decoder::{HeartRateSample, RunningSample};
use pacewire::sensors::{SensorEvent, Sport};

fn router(
    persistence: MemoryPersistence,
) -> (SampleRouter, crossbeam::channel::Receiver<SensorEvent>) {
    let (tx, rx) = crossbeam::channel::unbounded();
    let router = SampleRouter::new(RouterConfig::default(), Box::new(persistence), tx);
    (router, rx)
}

fn hr(t_ms: u64, bpm: u16) -> RouterInput {
    RouterInput::HeartRate(HeartRateSample {
        t_ms,
        bpm,
        rr_interval_s: None,
        energy_kj: None,
    })
}

fn run(t_s: f64, distance: f64) -> RouterInput {
    RouterInput::Fused(FusedSample::Running(RunningSample {
        t_s,
        speed_mps: 3.0,
        cadence_spm: 170,
        stride_len_m: None,
        total_distance_m: Some(distance),
        is_running: Some(true),
        power_w: None,
    }))
}

/// A heart rate spike is smoothed by the three-sample median.
#[test]
fn test_heart_rate_median() {
    let (mut router, _events) = router(MemoryPersistence::new());

    let bpm: Vec<u16> = [(0, 60), (1000, 90), (2000, 62)]
        .into_iter()
        .filter_map(|(t, bpm)| match router.handle(hr(t, bpm)) {
            Some(RoutedSample::HeartRate(s)) => Some(s.bpm),
            _ => None,
        })
        .collect();

    assert_eq!(bpm, vec![60, 75, 62]);
}

/// Session time starts at the first sample of the session.
#[test]
fn test_relative_timestamps() {
    let (mut router, _events) = router(MemoryPersistence::new());

    assert_eq!(router.handle(hr(5000, 120)).unwrap().t_ms(), 0);
    assert_eq!(router.handle(run(5.75, 10.0)).unwrap().t_ms(), 750);
}

/// The first distance while recording becomes the baseline.
#[test]
fn test_distance_baseline() {
    let store = MemoryPersistence::new();
    let (mut router, _events) = router(store.clone());

    // not recording: raw distance passes through
    assert_eq!(router.handle(run(1.0, 900.0)).unwrap().distance_m(), Some(900.0));

    router.handle(RouterInput::StartRecording);
    assert_eq!(router.status(), RecordingStatus::Recording);
    assert_eq!(router.handle(run(2.0, 1000.0)).unwrap().distance_m(), Some(0.0));
    assert_eq!(router.handle(run(3.0, 1250.0)).unwrap().distance_m(), Some(250.0));
    assert_eq!(router.distance_baseline(), Some(1000.0));

    // never negative, even if the device goes backwards
    assert_eq!(router.handle(run(4.0, 990.0)).unwrap().distance_m(), Some(0.0));

    router.handle(RouterInput::StopRecording);
    let activities = store.activities();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].sport, Sport::Running);
    assert_eq!(activities[0].samples.len(), 3);
    assert!(activities[0].ended);
}

/// An acknowledged device reset means the device distance is already
/// recording-relative.
#[test]
fn test_acknowledged_reset_uses_device_distance() {
    let (mut router, _events) = router(MemoryPersistence::new());

    router.handle(RouterInput::StartRecording);
    router.handle(RouterInput::DistanceReset { acknowledged: true });
    assert_eq!(router.handle(run(1.0, 12.5)).unwrap().distance_m(), Some(12.5));
}

/// A failed reset leaves baseline subtraction in charge.
#[test]
fn test_failed_reset_keeps_baseline() {
    let (mut router, _events) = router(MemoryPersistence::new());

    router.handle(RouterInput::StartRecording);
    router.handle(RouterInput::DistanceReset { acknowledged: false });
    assert_eq!(router.handle(run(1.0, 4000.0)).unwrap().distance_m(), Some(0.0));
}

/// Samples outside a recording reach the UI but not persistence.
#[test]
fn test_idle_samples_not_persisted() {
    let store = MemoryPersistence::new();
    let (mut router, events) = router(store.clone());

    router.handle(hr(0, 100));
    router.handle(run(0.5, 1.0));

    assert_eq!(
        events
            .try_iter()
            .filter(|event| matches!(event, SensorEvent::Sample(_)))
            .count(),
        2
    );
    assert!(store.activities().is_empty());
}

/// Starting twice does not open a second activity.
#[test]
fn test_recording_transitions_are_idempotent() {
    let store = MemoryPersistence::new();
    let (mut router, events) = router(store.clone());

    router.handle(RouterInput::StartRecording);
    router.handle(RouterInput::StartRecording);
    router.handle(RouterInput::StopRecording);
    router.handle(RouterInput::StopRecording);

    assert_eq!(store.activities().len(), 1);
    let toggles: Vec<bool> = events
        .try_iter()
        .filter_map(|event| match event {
            SensorEvent::Recording(on) => Some(on),
            _ => None,
        })
        .collect();
    assert_eq!(toggles, vec![true, false]);
}
