//! Application configuration.
//!
//! Loaded from `config.toml` in the data directory (or an explicit path).
//! Every section and field is optional; missing values take defaults.

use crate::recording::reset::ResetConfig;
use crate::recording::router::RouterConfig;
use crate::sensors::decoder::{CounterWidths, DecoderConfig};
use crate::sensors::manager::AcquisitionConfig;
use crate::sensors::profile::ProfileRule;
use crate::sensors::supervisor::{SupervisorConfig, SupervisorTiming};
use crate::sensors::types::{SensorRole, Sport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application version
    pub version: String,
    /// Data directory path
    #[serde(skip)]
    pub data_dir: PathBuf,
    pub sensors: SensorSettings,
    pub recording: RecordingSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::new(),
            sensors: SensorSettings::default(),
            recording: RecordingSettings::default(),
        }
    }
}

/// How to find the device for one role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSelector {
    /// Advertised name, matched case-insensitively as a substring
    pub name: Option<String>,
    /// Platform address; skips discovery when set
    pub address: Option<String>,
}

impl DeviceSelector {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            address: None,
        }
    }

    pub fn is_set(&self) -> bool {
        self.name.is_some() || self.address.is_some()
    }
}

/// Sensor-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub sport: Sport,
    pub heart_rate: DeviceSelector,
    /// Footpod or speed/cadence sensor
    pub speed_cadence: DeviceSelector,
    /// Separate cadence-only sensor
    pub cadence: DeviceSelector,
    pub power: DeviceSelector,
    pub trainer: DeviceSelector,
    /// Wheel circumference in meters; omit to skip CSC speed
    pub wheel_circumference_m: Option<f64>,
    pub wheel_counter_bits: u32,
    pub crank_counter_bits: u32,
    /// Extra advertised-name rules for picking running vs cycling profiles
    pub profile_rules: Vec<ProfileRule>,
    pub timing: TimingSettings,
}

impl Default for SensorSettings {
    fn default() -> Self {
        let counters = CounterWidths::default();
        Self {
            sport: Sport::default(),
            heart_rate: DeviceSelector::default(),
            speed_cadence: DeviceSelector::default(),
            cadence: DeviceSelector::default(),
            power: DeviceSelector::default(),
            trainer: DeviceSelector::default(),
            wheel_circumference_m: DecoderConfig::default().wheel_circumference_m,
            wheel_counter_bits: counters.wheel_bits,
            crank_counter_bits: counters.crank_bits,
            profile_rules: Vec::new(),
            timing: TimingSettings::default(),
        }
    }
}

impl SensorSettings {
    pub fn selector(&self, role: SensorRole) -> &DeviceSelector {
        match role {
            SensorRole::HeartRate => &self.heart_rate,
            SensorRole::SpeedCadence => &self.speed_cadence,
            SensorRole::Cadence => &self.cadence,
            SensorRole::Power => &self.power,
            SensorRole::Trainer => &self.trainer,
        }
    }

    pub fn selector_mut(&mut self, role: SensorRole) -> &mut DeviceSelector {
        match role {
            SensorRole::HeartRate => &mut self.heart_rate,
            SensorRole::SpeedCadence => &mut self.speed_cadence,
            SensorRole::Cadence => &mut self.cadence,
            SensorRole::Power => &mut self.power,
            SensorRole::Trainer => &mut self.trainer,
        }
    }

    pub fn decoder(&self) -> DecoderConfig {
        DecoderConfig {
            wheel_circumference_m: self.wheel_circumference_m,
            counters: CounterWidths {
                wheel_bits: self.wheel_counter_bits,
                crank_bits: self.crank_counter_bits,
            },
        }
    }
}

/// Supervisor timeouts and delays, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub scan_timeout_secs: f64,
    pub visibility_timeout_secs: f64,
    pub not_visible_delay_secs: f64,
    pub connect_timeout_secs: f64,
    pub in_progress_delay_secs: f64,
    pub backoff_secs: f64,
    pub max_transient_retries: u32,
}

impl Default for TimingSettings {
    fn default() -> Self {
        let timing = SupervisorTiming::default();
        Self {
            scan_timeout_secs: timing.scan_timeout.as_secs_f64(),
            visibility_timeout_secs: timing.visibility_timeout.as_secs_f64(),
            not_visible_delay_secs: timing.not_visible_delay.as_secs_f64(),
            connect_timeout_secs: timing.connect_timeout.as_secs_f64(),
            in_progress_delay_secs: timing.in_progress_delay.as_secs_f64(),
            backoff_secs: timing.backoff.as_secs_f64(),
            max_transient_retries: timing.max_transient_retries,
        }
    }
}

fn secs(value: f64, field: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::Invalid(format!("{} must be a non-negative number of seconds", field)))
}

impl TimingSettings {
    pub fn to_timing(&self) -> Result<SupervisorTiming, ConfigError> {
        Ok(SupervisorTiming {
            scan_timeout: secs(self.scan_timeout_secs, "scan_timeout_secs")?,
            visibility_timeout: secs(self.visibility_timeout_secs, "visibility_timeout_secs")?,
            not_visible_delay: secs(self.not_visible_delay_secs, "not_visible_delay_secs")?,
            connect_timeout: secs(self.connect_timeout_secs, "connect_timeout_secs")?,
            in_progress_delay: secs(self.in_progress_delay_secs, "in_progress_delay_secs")?,
            backoff: secs(self.backoff_secs, "backoff_secs")?,
            max_transient_retries: self.max_transient_retries,
        })
    }
}

/// Recording-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    /// Heart rate median window, in samples
    pub hr_smoothing_window: usize,
    /// How long to wait for a control point before falling back to baseline
    pub reset_wait_secs: f64,
    pub reset_poll_secs: f64,
    /// Wait for a control point response
    pub control_timeout_secs: f64,
    pub erg_retry_secs: f64,
    /// JSON-lines output; defaults to `activities.jsonl` in the data directory
    pub output: Option<PathBuf>,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        let reset = ResetConfig::default();
        Self {
            hr_smoothing_window: 3,
            reset_wait_secs: reset.wait_for_link.as_secs_f64(),
            reset_poll_secs: reset.poll_interval.as_secs_f64(),
            control_timeout_secs: 3.0,
            erg_retry_secs: 2.0,
            output: None,
        }
    }
}

impl AppConfig {
    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(c) = self.sensors.wheel_circumference_m {
            if !(c.is_finite() && c > 0.0) {
                return Err(ConfigError::Invalid(
                    "wheel_circumference_m must be positive".to_string(),
                ));
            }
        }
        for (field, bits) in [
            ("wheel_counter_bits", self.sensors.wheel_counter_bits),
            ("crank_counter_bits", self.sensors.crank_counter_bits),
        ] {
            if !(1..=32).contains(&bits) {
                return Err(ConfigError::Invalid(format!("{} must be between 1 and 32", field)));
            }
        }
        if self.recording.hr_smoothing_window == 0 {
            return Err(ConfigError::Invalid(
                "hr_smoothing_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Where recorded activities are written.
    pub fn output_path(&self) -> PathBuf {
        self.recording
            .output
            .clone()
            .unwrap_or_else(|| self.data_dir.join("activities.jsonl"))
    }

    /// Build the acquisition worker configuration.
    pub fn acquisition(&self) -> Result<AcquisitionConfig, ConfigError> {
        self.validate()?;
        let timing = self.sensors.timing.to_timing()?;
        let decoder = self.sensors.decoder();

        let roles = SensorRole::ALL
            .iter()
            .map(|role| {
                let selector = self.sensors.selector(*role);
                SupervisorConfig {
                    role: *role,
                    name: selector.name.clone(),
                    address: selector.address.clone(),
                    sport: self.sensors.sport,
                    decoder,
                    timing,
                }
            })
            .collect();

        Ok(AcquisitionConfig {
            sport: self.sensors.sport,
            roles,
            profile_rules: self.sensors.profile_rules.clone(),
            router: RouterConfig {
                sport: self.sensors.sport,
                hr_window: self.recording.hr_smoothing_window,
                persist: true,
            },
            reset: ResetConfig {
                wait_for_link: secs(self.recording.reset_wait_secs, "reset_wait_secs")?,
                poll_interval: secs(self.recording.reset_poll_secs, "reset_poll_secs")?,
            },
            control_timeout: secs(self.recording.control_timeout_secs, "control_timeout_secs")?,
            erg_retry_interval: secs(self.recording.erg_retry_secs, "erg_retry_secs")?,
        })
    }
}

/// Get the application data directory.
pub fn get_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "pacewire", "Pacewire")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the configuration file path.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Load configuration from the default location.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let path = get_config_path();
    if !path.exists() {
        return Ok(AppConfig {
            data_dir: get_data_dir(),
            ..Default::default()
        });
    }
    load_config_from(&path)
}

/// Load configuration from an explicit file.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

    let mut config: AppConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    config.data_dir = get_data_dir();

    Ok(config)
}

/// Save configuration to `path`.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
    }

    let content =
        toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

    Ok(())
}

/// Save configuration to the default location.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &get_config_path())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
