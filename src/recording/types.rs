//! Recording types: routed samples and the persistence collaborator.

use crate::sensors::decoder::{CyclingSample, RunningSample};
use crate::sensors::types::Sport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Status of the sample recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordingStatus {
    /// Streaming to the UI only
    #[default]
    Idle,
    /// Streaming and persisting
    Recording,
}

/// Output of the fusion engine: the latest known values of every field,
/// timestamped at the notification that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sport", rename_all = "snake_case")]
pub enum FusedSample {
    Running(RunningSample),
    Cycling(CyclingSample),
}

impl FusedSample {
    pub fn t_s(&self) -> f64 {
        match self {
            FusedSample::Running(s) => s.t_s,
            FusedSample::Cycling(s) => s.t_s,
        }
    }

    /// Cumulative distance as reported by the device.
    pub fn total_distance_m(&self) -> Option<f64> {
        match self {
            FusedSample::Running(s) => s.total_distance_m,
            FusedSample::Cycling(s) => s.total_distance_m,
        }
    }

    pub fn power_w(&self) -> Option<i32> {
        match self {
            FusedSample::Running(s) => s.power_w,
            FusedSample::Cycling(s) => s.power_w,
        }
    }
}

/// Heart rate after smoothing, relative to session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothedHeartRate {
    /// Milliseconds since session start
    pub t_ms: u64,
    /// Median of the recent window
    pub bpm: u16,
    pub raw_bpm: u16,
    pub rr_interval_s: Option<f64>,
    pub energy_kj: Option<f64>,
}

/// Running sample enriched with recording-relative distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedRunningSample {
    /// Milliseconds since session start
    pub t_ms: u64,
    #[serde(flatten)]
    pub sample: RunningSample,
    /// Distance since recording start, baseline subtracted
    pub distance_m: Option<f64>,
}

/// Cycling sample enriched with recording-relative distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedCyclingSample {
    /// Milliseconds since session start
    pub t_ms: u64,
    #[serde(flatten)]
    pub sample: CyclingSample,
    /// Distance since recording start, baseline subtracted
    pub distance_m: Option<f64>,
}

/// A processed sample, as forwarded to the UI and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutedSample {
    HeartRate(SmoothedHeartRate),
    Running(FusedRunningSample),
    Cycling(FusedCyclingSample),
}

impl RoutedSample {
    pub fn t_ms(&self) -> u64 {
        match self {
            RoutedSample::HeartRate(s) => s.t_ms,
            RoutedSample::Running(s) => s.t_ms,
            RoutedSample::Cycling(s) => s.t_ms,
        }
    }

    /// Recording-relative distance, if this sample carries one.
    pub fn distance_m(&self) -> Option<f64> {
        match self {
            RoutedSample::HeartRate(_) => None,
            RoutedSample::Running(s) => s.distance_m,
            RoutedSample::Cycling(s) => s.distance_m,
        }
    }
}

/// Identifier of a recorded activity.
pub type ActivityId = Uuid;

/// Storage collaborator. Batching and schema are its business; the router
/// only calls it and logs failures.
pub trait SamplePersistence: Send {
    fn begin_activity(&mut self, sport: Sport, started_at: DateTime<Utc>)
        -> anyhow::Result<ActivityId>;

    fn persist(&mut self, activity: ActivityId, sample: &RoutedSample) -> anyhow::Result<()>;

    fn end_activity(&mut self, activity: ActivityId) -> anyhow::Result<()>;
}

/// Persistence that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersistence;

impl SamplePersistence for NullPersistence {
    fn begin_activity(
        &mut self,
        _sport: Sport,
        _started_at: DateTime<Utc>,
    ) -> anyhow::Result<ActivityId> {
        Ok(Uuid::new_v4())
    }

    fn persist(&mut self, _activity: ActivityId, _sample: &RoutedSample) -> anyhow::Result<()> {
        Ok(())
    }

    fn end_activity(&mut self, _activity: ActivityId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One activity as held by [`MemoryPersistence`].
#[derive(Debug, Clone)]
pub struct StoredActivity {
    pub id: ActivityId,
    pub sport: Sport,
    pub started_at: DateTime<Utc>,
    pub ended: bool,
    pub samples: Vec<RoutedSample>,
}

/// In-memory persistence; clones share the same store.
#[derive(Debug, Default, Clone)]
pub struct MemoryPersistence {
    activities: Arc<Mutex<Vec<StoredActivity>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every activity recorded so far.
    pub fn activities(&self) -> Vec<StoredActivity> {
        self.activities
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

impl SamplePersistence for MemoryPersistence {
    fn begin_activity(
        &mut self,
        sport: Sport,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<ActivityId> {
        let id = Uuid::new_v4();
        let mut activities = self
            .activities
            .lock()
            .map_err(|_| anyhow::anyhow!("activity store poisoned"))?;
        activities.push(StoredActivity {
            id,
            sport,
            started_at,
            ended: false,
            samples: Vec::new(),
        });
        Ok(id)
    }

    fn persist(&mut self, activity: ActivityId, sample: &RoutedSample) -> anyhow::Result<()> {
        let mut activities = self
            .activities
            .lock()
            .map_err(|_| anyhow::anyhow!("activity store poisoned"))?;
        let stored = activities
            .iter_mut()
            .find(|a| a.id == activity)
            .ok_or_else(|| anyhow::anyhow!("unknown activity {}", activity))?;
        if stored.ended {
            anyhow::bail!("activity {} already ended", activity);
        }
        stored.samples.push(sample.clone());
        Ok(())
    }

    fn end_activity(&mut self, activity: ActivityId) -> anyhow::Result<()> {
        let mut activities = self
            .activities
            .lock()
            .map_err(|_| anyhow::anyhow!("activity store poisoned"))?;
        let stored = activities
            .iter_mut()
            .find(|a| a.id == activity)
            .ok_or_else(|| anyhow::anyhow!("unknown activity {}", activity))?;
        stored.ended = true;
        Ok(())
    }
}
