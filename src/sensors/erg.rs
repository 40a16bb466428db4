//! ERG mode: keeps the trainer's target power in line with the requested one.
//!
//! The requested target lives in a watch channel. The loop applies it through
//! the FTMS control point whenever it differs from what the trainer last
//! acknowledged, retrying at a fixed interval. A newer target supersedes one
//! still in flight, and every new trainer connection gets the target again.

use crate::sensors::fusion::FusionEngine;
use crate::sensors::gatt::ControlPoint;
use crate::sensors::stop::StopSignal;
use crate::sensors::types::{SensorEvent, SensorRole};
use crossbeam::channel::Sender;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Interval between attempts while a target is pending.
pub const ERG_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Run until stopped or until every target sender is dropped.
pub async fn run_erg_loop(
    fusion: Arc<FusionEngine>,
    mut targets: watch::Receiver<Option<u16>>,
    events: Sender<SensorEvent>,
    retry_interval: Duration,
    mut stop: StopSignal,
) {
    // (control point generation, watts) last acknowledged by the trainer
    let mut applied: Option<(u64, u16)> = None;

    loop {
        let desired = *targets.borrow_and_update();
        let generation = fusion.control_generation(ControlPoint::FitnessMachine);

        match (desired, generation) {
            (Some(watts), Some(generation)) if applied != Some((generation, watts)) => {
                match stop.run(fusion.set_target_power(watts)).await {
                    Err(_) => break,
                    Ok(Ok(true)) => {
                        if *targets.borrow() == desired {
                            tracing::info!("ERG target set to {} W", watts);
                            applied = Some((generation, watts));
                        }
                        // a superseding target is picked up on the next pass
                        continue;
                    }
                    Ok(Ok(false)) => {
                        tracing::warn!("Trainer rejected ERG target {} W", watts);
                        let _ = events.send(SensorEvent::Error {
                            role: Some(SensorRole::Trainer),
                            message: format!("ERG target {} W not accepted, retrying", watts),
                        });
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("ERG set failed: {}", e);
                        let _ = events.send(SensorEvent::Error {
                            role: Some(SensorRole::Trainer),
                            message: format!("ERG set failed, retrying: {}", e),
                        });
                    }
                }
            }
            (None, _) | (_, None) => applied = None,
            _ => {}
        }

        let woke = stop
            .run(async {
                tokio::select! {
                    changed = targets.changed() => changed.is_ok(),
                    _ = tokio::time::sleep(retry_interval) => true,
                }
            })
            .await;
        if woke != Ok(true) {
            break;
        }
    }
    tracing::debug!("ERG loop stopped");
}
