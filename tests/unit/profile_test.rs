//! Unit tests for profile selection and per-profile decoding.

use pacewire::sensors::decoder::{DecodeError, DecoderConfig, Reading};
use pacewire::sensors::gatt::{
    ControlPoint, CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID, CYCLING_POWER_MEASUREMENT_UUID,
    HEART_RATE_MEASUREMENT_UUID, RSC_MEASUREMENT_UUID, RSC_SERVICE_UUID,
};
use pacewire::sensors::profile::{role_services, ProfileKind, ProfileRegistry, ProfileRule};
use pacewire::sensors::simulated::frames;
use pacewire::sensors::transport::RawNotification;
use pacewire::sensors::{SensorProfile, SensorRole, SessionClock, Sport};
use std::time::{Duration, Instant};

fn notification(epoch: Instant, characteristic: uuid::Uuid, bytes: Vec<u8>, ms: u64) -> RawNotification {
    RawNotification {
        characteristic,
        bytes,
        arrival: epoch + Duration::from_millis(ms),
    }
}

/// User rules are checked before the built-in name rules.
#[test]
fn test_user_rules_take_precedence() {
    let registry = ProfileRegistry::with_rules(&[ProfileRule::new("Speed Pod", ProfileKind::Running)]);

    assert_eq!(
        registry.resolve(SensorRole::SpeedCadence, Sport::Cycling, Some("MY SPEED POD")),
        ProfileKind::Running
    );
    assert_eq!(
        registry.resolve(SensorRole::SpeedCadence, Sport::Running, Some("Garmin Speed")),
        ProfileKind::Cycling
    );
}

/// Fixed roles ignore the advertised name.
#[test]
fn test_fixed_roles() {
    let registry = ProfileRegistry::default();
    assert_eq!(
        registry.resolve(SensorRole::Trainer, Sport::Running, Some("Stryd")),
        ProfileKind::Trainer
    );
    assert_eq!(
        registry.resolve(SensorRole::HeartRate, Sport::Cycling, None),
        ProfileKind::HeartRate
    );
}

/// Speed/cadence discovery accepts either service.
#[test]
fn test_speed_cadence_services() {
    let services = role_services(SensorRole::SpeedCadence);
    assert!(services.contains(&RSC_SERVICE_UUID));
    assert!(services.contains(&CSC_SERVICE_UUID));
}

/// Footpods stream power as an optional extra and expose the SC control point.
#[test]
fn test_running_profile_characteristics() {
    assert_eq!(
        ProfileKind::Running.required_characteristics(),
        &[RSC_MEASUREMENT_UUID]
    );
    assert!(ProfileKind::Running
        .optional_characteristics()
        .contains(&CYCLING_POWER_MEASUREMENT_UUID));
    assert_eq!(
        ProfileKind::Running.control_point(),
        Some(ControlPoint::SpeedCadence)
    );
    assert_eq!(ProfileKind::HeartRate.control_point(), None);
}

/// Timestamps come from the session clock, not wall time.
#[test]
fn test_profile_decode_uses_session_clock() {
    let epoch = Instant::now();
    let clock = SessionClock::starting_at(epoch);
    let mut profile = SensorProfile::new(ProfileKind::Running, DecoderConfig::default());

    let reading = profile
        .decode(
            &notification(epoch, RSC_MEASUREMENT_UUID, frames::rsc(3.0, 84, None), 2500),
            &clock,
        )
        .unwrap();
    match reading {
        Reading::Running(sample) => assert!((sample.t_s - 2.5).abs() < 1e-9),
        other => panic!("unexpected {:?}", other),
    }

    let power = profile
        .decode(
            &notification(epoch, CYCLING_POWER_MEASUREMENT_UUID, frames::cycling_power(260), 2600),
            &clock,
        )
        .unwrap();
    assert!(matches!(power, Reading::Power(ref p) if p.power_w == 260));
}

/// A profile refuses characteristics that belong to another profile.
#[test]
fn test_profile_rejects_foreign_characteristic() {
    let epoch = Instant::now();
    let clock = SessionClock::starting_at(epoch);

    let mut cycling = SensorProfile::new(ProfileKind::Cycling, DecoderConfig::default());
    assert!(matches!(
        cycling.decode(
            &notification(epoch, HEART_RATE_MEASUREMENT_UUID, frames::heart_rate(120), 0),
            &clock
        ),
        Err(DecodeError::UnsupportedCharacteristic(_))
    ));

    let mut running = SensorProfile::new(ProfileKind::Running, DecoderConfig::default());
    assert!(running
        .decode(
            &notification(epoch, CSC_MEASUREMENT_UUID, frames::csc(Some((1, 0)), None), 0),
            &clock
        )
        .is_err());
}
