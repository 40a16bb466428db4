//! Unit tests for characteristic decoding.

use pacewire::sensors::decoder::{
    decode, decode_csc, decode_heart_rate, decode_indoor_bike_data, decode_rsc, CounterWidths,
    DecodeError, DecoderConfig, DecoderState, Reading,
};
use pacewire::sensors::gatt::{
    CSC_MEASUREMENT_UUID, CYCLING_POWER_MEASUREMENT_UUID, FTMS_CONTROL_POINT_UUID,
    HEART_RATE_MEASUREMENT_UUID,
};
use pacewire::sensors::simulated::frames;
use std::time::Duration;

fn at(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Heart rate with an RR interval converts 1/1024 s units to seconds.
#[test]
fn test_heart_rate_with_rr_interval() {
    // flags: 16-bit value, RR present
    let data = [0x11, 0x9A, 0x00, 0x00, 0x04];
    let sample = decode_heart_rate(&data, at(1500)).unwrap();

    assert_eq!(sample.t_ms, 1500);
    assert_eq!(sample.bpm, 154);
    assert_eq!(sample.rr_interval_s, Some(1.0));
    assert_eq!(sample.energy_kj, None);
}

/// RSC distance is reported in decimeters.
#[test]
fn test_rsc_with_distance() {
    let data = frames::rsc(3.5, 88, Some(1234.5));
    let sample = decode_rsc(&data, at(2000)).unwrap();

    assert!((sample.speed_mps - 3.5).abs() < 0.01);
    assert_eq!(sample.cadence_spm, 88);
    assert_eq!(sample.total_distance_m, Some(1234.5));
    assert_eq!(sample.is_running, Some(true));
    assert_eq!(sample.power_w, None);
    assert!((sample.t_s - 2.0).abs() < f64::EPSILON);
}

/// Truncated payloads are rejected, not padded.
#[test]
fn test_short_payloads_rejected() {
    assert!(matches!(
        decode_rsc(&[0x02, 0x00, 0x04, 0x50], at(0)),
        Err(DecodeError::Truncated { .. })
    ));
    assert!(decode_heart_rate(&[], at(0)).is_err());
    assert!(decode_indoor_bike_data(&[0x44], at(0)).is_err());
}

/// The first CSC notification has nothing to derive speed from.
#[test]
fn test_csc_first_notification_has_no_derived_values() {
    let config = DecoderConfig::default();
    let mut state = DecoderState::new();
    let sample = decode_csc(&frames::csc(Some((100, 1024)), None), at(0), &mut state, &config)
        .unwrap();

    assert_eq!(sample.cum_wheel_revs, Some(100));
    assert_eq!(sample.last_wheel_event_s, Some(1.0));
    assert_eq!(sample.speed_mps, None);
    assert_eq!(sample.wheel_rpm, None);
    assert!(state.wheel.is_some());
}

/// Crank counter and event time both wrap between notifications.
#[test]
fn test_crank_wraparound() {
    let config = DecoderConfig::default();
    let mut state = DecoderState::new();

    // 65530 revs at 62.0 s, then 5 revs at 4.0 s (after the 64 s rollover)
    decode_csc(&frames::csc(None, Some((65530, 63488))), at(0), &mut state, &config).unwrap();
    let sample =
        decode_csc(&frames::csc(None, Some((5, 4096))), at(1000), &mut state, &config).unwrap();

    // 11 revolutions in 6.0 seconds
    let cadence = sample.cadence_rpm.unwrap();
    assert!((cadence - 110.0).abs() < 1e-9);
}

/// A 32-bit wheel counter wrapping together with the event time.
#[test]
fn test_wheel_wraparound() {
    let config = DecoderConfig::default();
    let mut state = DecoderState::new();

    decode_csc(&frames::csc(Some((4_294_967_290, 61440)), None), at(0), &mut state, &config)
        .unwrap();
    let sample =
        decode_csc(&frames::csc(Some((5, 2048)), None), at(6000), &mut state, &config).unwrap();

    // 11 revolutions in 6.0 seconds
    assert!((sample.wheel_rpm.unwrap() - 110.0).abs() < 1e-9);
    assert!((sample.speed_mps.unwrap() - 11.0 * 2.105 / 6.0).abs() < 1e-9);
}

/// Wheel speed uses the configured circumference.
#[test]
fn test_wheel_speed_from_circumference() {
    let config = DecoderConfig {
        wheel_circumference_m: Some(2.0),
        counters: CounterWidths::default(),
    };
    let mut state = DecoderState::new();

    decode_csc(&frames::csc(Some((1000, 0)), None), at(0), &mut state, &config).unwrap();
    let sample =
        decode_csc(&frames::csc(Some((1004, 2048)), None), at(2000), &mut state, &config).unwrap();

    assert!((sample.speed_mps.unwrap() - 4.0).abs() < 1e-9);
    assert!((sample.wheel_rpm.unwrap() - 120.0).abs() < 1e-9);
}

/// Without a circumference, rpm is still derived but speed is not.
#[test]
fn test_wheel_without_circumference() {
    let config = DecoderConfig {
        wheel_circumference_m: None,
        counters: CounterWidths::default(),
    };
    let mut state = DecoderState::new();

    decode_csc(&frames::csc(Some((10, 0)), None), at(0), &mut state, &config).unwrap();
    let sample =
        decode_csc(&frames::csc(Some((12, 1024)), None), at(1000), &mut state, &config).unwrap();

    assert_eq!(sample.speed_mps, None);
    assert!(sample.wheel_rpm.is_some());
}

/// A 16-bit wheel counter wraps at 65536 instead of 2^32.
#[test]
fn test_narrow_wheel_counter() {
    let config = DecoderConfig {
        wheel_circumference_m: Some(2.0),
        counters: CounterWidths {
            wheel_bits: 16,
            crank_bits: 16,
        },
    };
    let mut state = DecoderState::new();

    decode_csc(&frames::csc(Some((65534, 0)), None), at(0), &mut state, &config).unwrap();
    let sample =
        decode_csc(&frames::csc(Some((2, 1024)), None), at(1000), &mut state, &config).unwrap();

    assert!((sample.wheel_rpm.unwrap() - 240.0).abs() < 1e-9);
}

/// Identical event times mean zero elapsed time: no derived values.
#[test]
fn test_zero_elapsed_time_skips_derivation() {
    let config = DecoderConfig::default();
    let mut state = DecoderState::new();

    decode_csc(&frames::csc(Some((50, 3000)), Some((20, 3000))), at(0), &mut state, &config)
        .unwrap();
    let sample = decode_csc(
        &frames::csc(Some((50, 3000)), Some((20, 3000))),
        at(250),
        &mut state,
        &config,
    )
    .unwrap();

    assert_eq!(sample.speed_mps, None);
    assert_eq!(sample.cadence_rpm, None);
    assert_eq!(sample.cum_wheel_revs, Some(50));
}

/// A malformed notification leaves the previous event in place.
#[test]
fn test_state_untouched_by_malformed_payload() {
    let config = DecoderConfig::default();
    let mut state = DecoderState::new();

    decode_csc(&frames::csc(Some((100, 0)), None), at(0), &mut state, &config).unwrap();
    let before = state.clone();
    assert!(decode_csc(&[0x01, 0x00], at(100), &mut state, &config).is_err());
    assert_eq!(state, before);
}

/// Decoding the same bytes against the same state is deterministic.
#[test]
fn test_decode_is_repeatable() {
    let config = DecoderConfig::default();
    let data = frames::csc(Some((205, 2048)), Some((31, 2048)));

    let mut first = DecoderState::new();
    let mut second = DecoderState::new();
    for state in [&mut first, &mut second] {
        decode_csc(&frames::csc(Some((200, 0)), Some((30, 0))), at(0), state, &config).unwrap();
    }

    let a = decode_csc(&data, at(2000), &mut first, &config).unwrap();
    let b = decode_csc(&data, at(2000), &mut second, &config).unwrap();
    assert_eq!(a, b);
}

/// Trainer data: speed in 0.01 km/h, cadence in 0.5 rpm, 24-bit distance.
#[test]
fn test_indoor_bike_data() {
    let data = frames::indoor_bike(36.0, 90.0, 4321, 250);
    let sample = decode_indoor_bike_data(&data, at(0)).unwrap();

    assert!((sample.speed_mps.unwrap() - 10.0).abs() < 1e-9);
    assert_eq!(sample.cadence_rpm, Some(90.0));
    assert_eq!(sample.total_distance_m, Some(4321.0));
    assert_eq!(sample.power_w, Some(250));
}

/// The dispatcher routes by characteristic and refuses unknown ones.
#[test]
fn test_decode_dispatch() {
    let config = DecoderConfig::default();
    let mut state = DecoderState::new();

    let reading = decode(
        HEART_RATE_MEASUREMENT_UUID,
        &frames::heart_rate(120),
        at(0),
        &mut state,
        &config,
    )
    .unwrap();
    assert!(matches!(reading, Reading::HeartRate(ref s) if s.bpm == 120));

    let reading = decode(
        CYCLING_POWER_MEASUREMENT_UUID,
        &frames::cycling_power(-15),
        at(0),
        &mut state,
        &config,
    )
    .unwrap();
    assert!(matches!(reading, Reading::Power(ref s) if s.power_w == -15));

    let reading = decode(
        CSC_MEASUREMENT_UUID,
        &frames::csc(Some((1, 0)), None),
        at(0),
        &mut state,
        &config,
    )
    .unwrap();
    assert!(matches!(reading, Reading::Cycling(_)));

    assert!(matches!(
        decode(FTMS_CONTROL_POINT_UUID, &[0x80], at(0), &mut state, &config),
        Err(DecodeError::UnsupportedCharacteristic(_))
    ));
}
