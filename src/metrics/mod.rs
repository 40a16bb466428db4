//! Metrics module.

pub mod smoothing;

pub use smoothing::RollingMedian;
