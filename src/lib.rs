//! Pacewire - BLE fitness telemetry acquisition
//!
//! Connects to heart rate, footpod, speed/cadence, power and FTMS trainer
//! sensors, keeps each link alive independently, fuses the streams into one
//! running or cycling sample stream and routes it to a display consumer and a
//! recording sink.

pub mod metrics;
pub mod recording;
pub mod sensors;
pub mod storage;

// Re-export commonly used types
pub use recording::router::SampleRouter;
pub use sensors::manager::SensorManager;
pub use storage::config::AppConfig;
