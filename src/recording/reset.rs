//! Distance reset at recording start.
//!
//! Waits briefly for a control point to come up, asks the device to zero its
//! cumulative distance and reports the outcome to the router. Any failure is
//! non-fatal: the router then falls back to subtracting the first observed
//! distance.

use crate::recording::router::RouterInput;
use crate::sensors::fusion::FusionEngine;
use crate::sensors::gatt::ControlPoint;
use crate::sensors::stop::StopSignal;
use crate::sensors::types::SensorEvent;
use crossbeam::channel::Sender;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Timing of the reset workflow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResetConfig {
    /// How long to wait for a control point before giving up
    pub wait_for_link: Duration,
    pub poll_interval: Duration,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            wait_for_link: Duration::from_secs(6),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// How a reset attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The device zeroed its distance
    Acknowledged,
    /// Baseline subtraction takes over
    Fallback(String),
    /// Shutdown arrived while waiting
    Cancelled,
}

fn control_available(fusion: &FusionEngine) -> bool {
    fusion.has_control(ControlPoint::SpeedCadence) || fusion.has_control(ControlPoint::FitnessMachine)
}

/// Run one reset attempt and tell the router how it went.
pub async fn reset_distance_workflow(
    fusion: &FusionEngine,
    router: &mpsc::UnboundedSender<RouterInput>,
    events: &Sender<SensorEvent>,
    config: ResetConfig,
    stop: &mut StopSignal,
) -> ResetOutcome {
    let deadline = Instant::now() + config.wait_for_link;
    while !control_available(fusion) && Instant::now() < deadline {
        if stop.sleep(config.poll_interval).await.is_err() {
            return ResetOutcome::Cancelled;
        }
    }

    let outcome = if !control_available(fusion) {
        ResetOutcome::Fallback("no sensor with a control point connected".to_string())
    } else {
        match stop.run(fusion.reset_distance()).await {
            Err(_) => return ResetOutcome::Cancelled,
            Ok(Ok(true)) => ResetOutcome::Acknowledged,
            Ok(Ok(false)) => ResetOutcome::Fallback("sensor didn't accept distance reset".to_string()),
            Ok(Err(e)) => ResetOutcome::Fallback(format!("distance reset failed: {}", e)),
        }
    };

    let acknowledged = outcome == ResetOutcome::Acknowledged;
    if router
        .send(RouterInput::DistanceReset { acknowledged })
        .is_err()
    {
        tracing::debug!("Sample router is gone, dropping reset outcome");
    }

    match &outcome {
        ResetOutcome::Acknowledged => tracing::info!("Device distance reset acknowledged"),
        ResetOutcome::Fallback(reason) => {
            tracing::info!("Using distance baseline: {}", reason);
            let _ = events.send(SensorEvent::Info(format!(
                "Using distance baseline ({})",
                reason
            )));
        }
        ResetOutcome::Cancelled => {}
    }
    outcome
}
