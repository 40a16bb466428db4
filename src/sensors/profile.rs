//! Sensor profiles: which characteristics a device streams and how they are
//! decoded.
//!
//! A [`SensorProfile`] is a closed set of variants, one per supported sensor
//! family, each carrying its own decoder state. The [`ProfileRegistry`] picks
//! the variant from the advertised name once, when a device is resolved.

use crate::sensors::decoder::{
    decode_csc, decode_cycling_power, decode_heart_rate, decode_indoor_bike_data, decode_rsc,
    DecodeError, DecoderConfig, DecoderState, Reading,
};
use crate::sensors::gatt::{
    ControlPoint, CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID, CYCLING_POWER_MEASUREMENT_UUID,
    CYCLING_POWER_SERVICE_UUID, FTMS_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID, INDOOR_BIKE_DATA_UUID, RSC_MEASUREMENT_UUID, RSC_SERVICE_UUID,
};
use crate::sensors::transport::RawNotification;
use crate::sensors::types::{DataChannel, SensorRole, SessionClock, Sport};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sensor family, without decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    HeartRate,
    /// RSC footpod, optionally exposing running power
    Running,
    /// CSC wheel/crank sensor, optionally exposing cycling power
    Cycling,
    Power,
    Trainer,
}

impl ProfileKind {
    /// Characteristics that must subscribe for the link to be useful.
    pub fn required_characteristics(self) -> &'static [Uuid] {
        match self {
            ProfileKind::HeartRate => &[HEART_RATE_MEASUREMENT_UUID],
            ProfileKind::Running => &[RSC_MEASUREMENT_UUID],
            ProfileKind::Cycling => &[CSC_MEASUREMENT_UUID],
            ProfileKind::Power => &[CYCLING_POWER_MEASUREMENT_UUID],
            ProfileKind::Trainer => &[INDOOR_BIKE_DATA_UUID],
        }
    }

    /// Characteristics subscribed when the device has them.
    pub fn optional_characteristics(self) -> &'static [Uuid] {
        match self {
            ProfileKind::Running | ProfileKind::Cycling => &[CYCLING_POWER_MEASUREMENT_UUID],
            _ => &[],
        }
    }

    /// Control point used for distance reset and trainer commands.
    pub fn control_point(self) -> Option<ControlPoint> {
        match self {
            ProfileKind::Running | ProfileKind::Cycling => Some(ControlPoint::SpeedCadence),
            ProfileKind::Trainer => Some(ControlPoint::FitnessMachine),
            _ => None,
        }
    }
}

/// Services advertised by devices that can fill a role.
pub fn role_services(role: SensorRole) -> Vec<Uuid> {
    match role {
        SensorRole::HeartRate => vec![HEART_RATE_SERVICE_UUID],
        SensorRole::SpeedCadence | SensorRole::Cadence => vec![RSC_SERVICE_UUID, CSC_SERVICE_UUID],
        SensorRole::Power => vec![CYCLING_POWER_SERVICE_UUID],
        SensorRole::Trainer => vec![FTMS_SERVICE_UUID],
    }
}

/// Data channel a characteristic feeds.
pub fn channel_of(characteristic: Uuid) -> Option<DataChannel> {
    match characteristic {
        HEART_RATE_MEASUREMENT_UUID => Some(DataChannel::HeartRate),
        RSC_MEASUREMENT_UUID | CSC_MEASUREMENT_UUID => Some(DataChannel::SpeedCadence),
        CYCLING_POWER_MEASUREMENT_UUID => Some(DataChannel::Power),
        INDOOR_BIKE_DATA_UUID => Some(DataChannel::IndoorBike),
        _ => None,
    }
}

/// A sensor profile together with its per-connection decoder state.
#[derive(Debug, Clone)]
pub enum SensorProfile {
    HeartRate,
    Running,
    Cycling {
        state: DecoderState,
        config: DecoderConfig,
    },
    Power,
    Trainer,
}

impl SensorProfile {
    /// Fresh profile with empty decoder state.
    pub fn new(kind: ProfileKind, config: DecoderConfig) -> Self {
        match kind {
            ProfileKind::HeartRate => SensorProfile::HeartRate,
            ProfileKind::Running => SensorProfile::Running,
            ProfileKind::Cycling => SensorProfile::Cycling {
                state: DecoderState::new(),
                config,
            },
            ProfileKind::Power => SensorProfile::Power,
            ProfileKind::Trainer => SensorProfile::Trainer,
        }
    }

    pub fn kind(&self) -> ProfileKind {
        match self {
            SensorProfile::HeartRate => ProfileKind::HeartRate,
            SensorProfile::Running => ProfileKind::Running,
            SensorProfile::Cycling { .. } => ProfileKind::Cycling,
            SensorProfile::Power => ProfileKind::Power,
            SensorProfile::Trainer => ProfileKind::Trainer,
        }
    }

    /// Decode one notification of a characteristic this profile subscribes to.
    pub fn decode(
        &mut self,
        notification: &RawNotification,
        clock: &SessionClock,
    ) -> Result<Reading, DecodeError> {
        let elapsed = clock.elapsed_at(notification.arrival);
        let data = notification.bytes.as_slice();

        match (self, notification.characteristic) {
            (_, CYCLING_POWER_MEASUREMENT_UUID) => {
                decode_cycling_power(data, elapsed).map(Reading::Power)
            }
            (SensorProfile::HeartRate, HEART_RATE_MEASUREMENT_UUID) => {
                decode_heart_rate(data, elapsed).map(Reading::HeartRate)
            }
            (SensorProfile::Running, RSC_MEASUREMENT_UUID) => {
                decode_rsc(data, elapsed).map(Reading::Running)
            }
            (SensorProfile::Cycling { state, config }, CSC_MEASUREMENT_UUID) => {
                decode_csc(data, elapsed, state, config).map(Reading::Cycling)
            }
            (SensorProfile::Trainer, INDOOR_BIKE_DATA_UUID) => {
                decode_indoor_bike_data(data, elapsed).map(Reading::Trainer)
            }
            (_, other) => Err(DecodeError::UnsupportedCharacteristic(other)),
        }
    }
}

/// Maps an advertised-name substring to a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRule {
    pub name_contains: String,
    pub profile: ProfileKind,
}

impl ProfileRule {
    pub fn new(name_contains: &str, profile: ProfileKind) -> Self {
        Self {
            name_contains: name_contains.to_lowercase(),
            profile,
        }
    }
}

/// Ordered name rules; the first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRegistry {
    rules: Vec<ProfileRule>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self {
            rules: vec![
                ProfileRule::new("stryd", ProfileKind::Running),
                ProfileRule::new("footpod", ProfileKind::Running),
                ProfileRule::new("milestone", ProfileKind::Running),
                ProfileRule::new("rsc", ProfileKind::Running),
                ProfileRule::new("csc", ProfileKind::Cycling),
                ProfileRule::new("speed", ProfileKind::Cycling),
                ProfileRule::new("cadence", ProfileKind::Cycling),
            ],
        }
    }
}

impl ProfileRegistry {
    pub fn new(rules: Vec<ProfileRule>) -> Self {
        Self { rules }
    }

    /// Registry with user rules evaluated before the built-in ones.
    pub fn with_rules(rules: &[ProfileRule]) -> Self {
        let mut registry = Self::default();
        let mut merged: Vec<ProfileRule> = rules
            .iter()
            .map(|r| ProfileRule::new(&r.name_contains, r.profile))
            .collect();
        merged.append(&mut registry.rules);
        registry.rules = merged;
        registry
    }

    /// Decide the profile for a role, using the advertised name for
    /// speed/cadence devices that could be either running or cycling.
    pub fn resolve(&self, role: SensorRole, sport: Sport, name: Option<&str>) -> ProfileKind {
        match role {
            SensorRole::HeartRate => ProfileKind::HeartRate,
            SensorRole::Power => ProfileKind::Power,
            SensorRole::Trainer => ProfileKind::Trainer,
            SensorRole::SpeedCadence | SensorRole::Cadence => {
                let by_name = name.and_then(|name| {
                    let lowered = name.to_lowercase();
                    self.rules
                        .iter()
                        .filter(|rule| {
                            matches!(rule.profile, ProfileKind::Running | ProfileKind::Cycling)
                        })
                        .find(|rule| lowered.contains(&rule.name_contains))
                        .map(|rule| rule.profile)
                });
                by_name.unwrap_or(match sport {
                    Sport::Running => ProfileKind::Running,
                    Sport::Cycling => ProfileKind::Cycling,
                })
            }
        }
    }
}
