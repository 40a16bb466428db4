//! Storage module for configuration.

pub mod config;

pub use config::{
    AppConfig, ConfigError, DeviceSelector, RecordingSettings, SensorSettings, TimingSettings,
};
