//! Sensor types and enums shared by supervisors, fusion and the router.

use crate::recording::types::RoutedSample;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Physical sensor role. Each configured role gets one link supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    /// Heart rate belt or optical strap
    HeartRate,
    /// Footpod or bike speed/cadence sensor
    SpeedCadence,
    /// Separate cadence-only sensor
    Cadence,
    /// Standalone power meter
    Power,
    /// FTMS smart trainer
    Trainer,
}

impl SensorRole {
    pub const ALL: [SensorRole; 5] = [
        SensorRole::HeartRate,
        SensorRole::SpeedCadence,
        SensorRole::Cadence,
        SensorRole::Power,
        SensorRole::Trainer,
    ];

    /// Channel whose health decides whether the role counts as connected.
    pub fn primary_channel(self) -> DataChannel {
        match self {
            SensorRole::HeartRate => DataChannel::HeartRate,
            SensorRole::SpeedCadence | SensorRole::Cadence => DataChannel::SpeedCadence,
            SensorRole::Power => DataChannel::Power,
            SensorRole::Trainer => DataChannel::IndoorBike,
        }
    }
}

impl std::fmt::Display for SensorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorRole::HeartRate => write!(f, "Heart Rate"),
            SensorRole::SpeedCadence => write!(f, "Speed/Cadence"),
            SensorRole::Cadence => write!(f, "Cadence"),
            SensorRole::Power => write!(f, "Power"),
            SensorRole::Trainer => write!(f, "Trainer"),
        }
    }
}

/// Activity type the speed/cadence stream is interpreted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sport {
    #[default]
    Running,
    Cycling,
}

impl std::fmt::Display for Sport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sport::Running => write!(f, "Running"),
            Sport::Cycling => write!(f, "Cycling"),
        }
    }
}

/// Data channel on a device, tracked independently for link health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataChannel {
    HeartRate,
    /// RSC or CSC measurement
    SpeedCadence,
    /// Cycling power measurement
    Power,
    /// FTMS indoor bike data
    IndoorBike,
}

impl std::fmt::Display for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataChannel::HeartRate => write!(f, "HR"),
            DataChannel::SpeedCadence => write!(f, "Speed/Cadence"),
            DataChannel::Power => write!(f, "Power"),
            DataChannel::IndoorBike => write!(f, "Trainer"),
        }
    }
}

/// Supervisor state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Idle,
    ResolvingAddress,
    AwaitingVisibility,
    Connecting,
    Streaming,
    Disconnected,
    Error,
    Backoff,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::ResolvingAddress => write!(f, "Resolving address..."),
            LinkState::AwaitingVisibility => write!(f, "Waiting for device..."),
            LinkState::Connecting => write!(f, "Connecting..."),
            LinkState::Streaming => write!(f, "Streaming"),
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Error => write!(f, "Error"),
            LinkState::Backoff => write!(f, "Retrying soon"),
        }
    }
}

/// Link health of one data channel of one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub role: SensorRole,
    pub channel: DataChannel,
    pub connected: bool,
    /// Last human-readable error, cleared on reconnect
    pub last_error: Option<String>,
}

impl LinkStatus {
    pub fn down(role: SensorRole, channel: DataChannel) -> Self {
        Self {
            role,
            channel,
            connected: false,
            last_error: None,
        }
    }
}

/// Events from the acquisition core, delivered to the UI thread.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    /// Processed sample ready for display
    Sample(RoutedSample),
    /// Link health changed for a data channel
    Link(LinkStatus),
    /// Supervisor state machine transition
    State { role: SensorRole, state: LinkState },
    /// Informational, non-error status message
    Info(String),
    /// User-visible, non-fatal error message
    Error { role: Option<SensorRole>, message: String },
    /// Recording started or stopped
    Recording(bool),
}

/// Monotonic clock shared by all decoders of one acquisition run.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn starting_at(epoch: Instant) -> Self {
        Self { epoch }
    }

    /// Time elapsed between the clock epoch and `at` (zero if earlier).
    pub fn elapsed_at(&self, at: Instant) -> Duration {
        at.saturating_duration_since(self.epoch)
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur in the sensor system.
#[derive(Debug, Error)]
pub enum SensorError {
    /// BLE adapter not found or unavailable
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// Role has neither a device name nor an address configured
    #[error("{0} sensor is not configured")]
    NotConfigured(SensorRole),

    /// Discovery scan did not find a matching device
    #[error("{role} sensor '{name}' not found")]
    SensorNotFound { role: SensorRole, name: String },

    /// Connection to sensor failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Transient adapter errors kept recurring
    #[error("Gave up after {0} busy-adapter retries")]
    RetriesExhausted(u32),

    /// Failed to subscribe to sensor notifications
    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    /// Failed to write to sensor characteristic
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Unsupported sensor or protocol
    #[error("Unsupported sensor type or protocol")]
    Unsupported,

    /// Acquisition worker is not running
    #[error("Acquisition is not running")]
    NotRunning,

    /// Failed to start the acquisition worker
    #[error("Failed to start acquisition worker: {0}")]
    Runtime(String),

    /// Generic BLE error
    #[error("BLE error: {0}")]
    BleError(String),
}
