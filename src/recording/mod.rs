//! Recording module: routing, distance baselines and persistence.

pub mod reset;
pub mod router;
pub mod sink;
pub mod types;

pub use reset::{reset_distance_workflow, ResetConfig, ResetOutcome};
pub use router::{RouterConfig, RouterInput, SampleRouter};
pub use sink::JsonLinesSink;
pub use types::{
    ActivityId, FusedCyclingSample, FusedRunningSample, FusedSample, MemoryPersistence,
    NullPersistence, RecordingStatus, RoutedSample, SamplePersistence, SmoothedHeartRate,
    StoredActivity,
};
