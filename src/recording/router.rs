//! Sample router.
//!
//! Runs as a single task fed by an unbounded channel. It establishes the
//! session start time, smooths heart rate, subtracts the distance baseline
//! while recording, and forwards every processed sample to the UI channel and
//! (while recording) to the persistence collaborator. Neither sink can push an
//! error back into acquisition.

use crate::metrics::smoothing::RollingMedian;
use crate::recording::types::{
    ActivityId, FusedCyclingSample, FusedRunningSample, FusedSample, RecordingStatus,
    RoutedSample, SamplePersistence, SmoothedHeartRate,
};
use crate::sensors::decoder::HeartRateSample;
use crate::sensors::stop::StopSignal;
use crate::sensors::types::{SensorEvent, Sport};
use chrono::Utc;
use crossbeam::channel::Sender;
use tokio::sync::mpsc;

/// Messages accepted by the router task.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterInput {
    HeartRate(HeartRateSample),
    Fused(FusedSample),
    StartRecording,
    StopRecording,
    /// Outcome of the device distance reset issued at recording start
    DistanceReset { acknowledged: bool },
}

/// Router settings.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub sport: Sport,
    /// Heart rate median window
    pub hr_window: usize,
    /// Whether recorded samples reach the persistence collaborator
    pub persist: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sport: Sport::Running,
            hr_window: 3,
            persist: true,
        }
    }
}

pub struct SampleRouter {
    config: RouterConfig,
    status: RecordingStatus,
    activity: Option<ActivityId>,
    /// Session start, in session-clock milliseconds
    start_ms: Option<u64>,
    hr_window: RollingMedian,
    distance_baseline: Option<f64>,
    persistence: Box<dyn SamplePersistence>,
    ui: Sender<SensorEvent>,
}

impl SampleRouter {
    pub fn new(
        config: RouterConfig,
        persistence: Box<dyn SamplePersistence>,
        ui: Sender<SensorEvent>,
    ) -> Self {
        Self {
            config,
            status: RecordingStatus::Idle,
            activity: None,
            start_ms: None,
            hr_window: RollingMedian::new(config.hr_window),
            distance_baseline: None,
            persistence,
            ui,
        }
    }

    pub fn status(&self) -> RecordingStatus {
        self.status
    }

    pub fn is_recording(&self) -> bool {
        self.status == RecordingStatus::Recording
    }

    /// Current distance baseline, if one has been established.
    pub fn distance_baseline(&self) -> Option<f64> {
        self.distance_baseline
    }

    /// Process one input. Returns the routed sample, if any.
    pub fn handle(&mut self, input: RouterInput) -> Option<RoutedSample> {
        match input {
            RouterInput::HeartRate(sample) => {
                let routed = self.route_heart_rate(sample);
                self.deliver(&routed);
                Some(routed)
            }
            RouterInput::Fused(sample) => {
                let routed = self.route_fused(sample);
                self.deliver(&routed);
                Some(routed)
            }
            RouterInput::StartRecording => {
                self.start_recording();
                None
            }
            RouterInput::StopRecording => {
                self.stop_recording();
                None
            }
            RouterInput::DistanceReset { acknowledged } => {
                if acknowledged && self.is_recording() {
                    self.distance_baseline = Some(0.0);
                }
                None
            }
        }
    }

    /// Elapsed milliseconds since session start, establishing the start on
    /// the first sample.
    fn relative_ms(&mut self, t_ms: u64) -> u64 {
        let start = *self.start_ms.get_or_insert(t_ms);
        t_ms.saturating_sub(start)
    }

    fn route_heart_rate(&mut self, sample: HeartRateSample) -> RoutedSample {
        let t_ms = self.relative_ms(sample.t_ms);
        let bpm = self.hr_window.add(sample.bpm);
        RoutedSample::HeartRate(SmoothedHeartRate {
            t_ms,
            bpm,
            raw_bpm: sample.bpm,
            rr_interval_s: sample.rr_interval_s,
            energy_kj: sample.energy_kj,
        })
    }

    fn baselined(&mut self, distance: Option<f64>) -> Option<f64> {
        let distance = distance?;
        if !self.is_recording() {
            return Some(distance);
        }
        let base = *self.distance_baseline.get_or_insert(distance);
        Some((distance - base).max(0.0))
    }

    fn route_fused(&mut self, sample: FusedSample) -> RoutedSample {
        let t_ms = self.relative_ms((sample.t_s() * 1000.0).max(0.0) as u64);
        let distance_m = self.baselined(sample.total_distance_m());
        match sample {
            FusedSample::Running(sample) => RoutedSample::Running(FusedRunningSample {
                t_ms,
                sample,
                distance_m,
            }),
            FusedSample::Cycling(sample) => RoutedSample::Cycling(FusedCyclingSample {
                t_ms,
                sample,
                distance_m,
            }),
        }
    }

    fn deliver(&mut self, routed: &RoutedSample) {
        // unbounded: never blocks acquisition
        if self.ui.send(SensorEvent::Sample(routed.clone())).is_err() {
            tracing::trace!("UI receiver dropped");
        }

        if let (true, Some(activity)) = (self.is_recording(), self.activity) {
            if let Err(e) = self.persistence.persist(activity, routed) {
                tracing::warn!("Failed to persist sample: {:#}", e);
            }
        }
    }

    fn start_recording(&mut self) {
        if self.is_recording() {
            return;
        }
        self.activity = if self.config.persist {
            match self
                .persistence
                .begin_activity(self.config.sport, Utc::now())
            {
                Ok(id) => {
                    tracing::info!("Started activity {}", id);
                    Some(id)
                }
                Err(e) => {
                    tracing::error!("Failed to start activity: {:#}", e);
                    let _ = self.ui.send(SensorEvent::Error {
                        role: None,
                        message: format!("Recording will not be saved: {}", e),
                    });
                    None
                }
            }
        } else {
            None
        };
        self.status = RecordingStatus::Recording;
        self.start_ms = None;
        self.distance_baseline = None;
        let _ = self.ui.send(SensorEvent::Recording(true));
    }

    fn stop_recording(&mut self) {
        if !self.is_recording() {
            return;
        }
        if let Some(activity) = self.activity.take() {
            match self.persistence.end_activity(activity) {
                Ok(()) => tracing::info!("Finished activity {}", activity),
                Err(e) => tracing::error!("Failed to finish activity {}: {:#}", activity, e),
            }
        }
        self.status = RecordingStatus::Idle;
        let _ = self.ui.send(SensorEvent::Recording(false));
    }

    /// Drain inputs until the channel closes or stop is raised. An open
    /// recording is closed on the way out.
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<RouterInput>, mut stop: StopSignal) {
        loop {
            match stop.run(inputs.recv()).await {
                Ok(Some(input)) => {
                    self.handle(input);
                }
                Ok(None) | Err(_) => break,
            }
        }
        // flush what producers queued before stopping
        while let Ok(input) = inputs.try_recv() {
            self.handle(input);
        }
        self.stop_recording();
        tracing::debug!("Sample router stopped");
    }
}
