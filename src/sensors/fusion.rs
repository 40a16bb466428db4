//! Fusion engine for speed/cadence, power and trainer streams.
//!
//! Every decoded reading updates one "latest known" record and immediately
//! emits a fused sample carrying the newest value of every field. The record
//! is only touched under a single lock, and the fused sample is handed to the
//! router while that lock is held, so concurrent producers can never emit a
//! torn sample or reorder each other's output.
//!
//! The engine also tracks per-channel link health and owns the control point
//! connections used for distance reset and ERG commands.

use crate::recording::router::RouterInput;
use crate::recording::types::FusedSample;
use crate::sensors::decoder::{CyclingSample, PowerSample, Reading, RunningSample, TrainerSample};
use crate::sensors::gatt::{
    build_request_control, build_reset, build_set_cumulative_value, build_set_target_power,
    parse_control_response, ControlPoint, ControlResult,
};
use crate::sensors::transport::{BleConnection, TransportError};
use crate::sensors::types::{DataChannel, LinkStatus, SensorError, SensorEvent, SensorRole, Sport};
use crossbeam::channel::Sender;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Diagnostic information about the fusion state.
#[derive(Debug, Clone, Default)]
pub struct FusionDiagnostics {
    /// Link health of every tracked channel
    pub links: Vec<LinkStatus>,
    /// Fused samples emitted since start
    pub samples_emitted: u64,
    /// When the record was last updated
    pub last_update: Option<Instant>,
    /// Control points currently available
    pub control_points: Vec<ControlPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct WheelBlock {
    cum_revs: Option<u32>,
    last_event_s: Option<f64>,
    speed_mps: Option<f64>,
    rpm: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct CrankBlock {
    cum_revs: Option<u16>,
    last_event_s: Option<f64>,
    cadence_rpm: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PowerValue {
    role: SensorRole,
    power_w: i32,
}

/// Newest known value of every field, by contributing source.
#[derive(Debug, Clone, Default)]
struct LatestKnown {
    rsc: Option<RunningSample>,
    /// Step cadence from a dedicated cadence pod
    cadence_spm: Option<u16>,
    wheel: Option<WheelBlock>,
    crank: Option<CrankBlock>,
    /// Crank data from a dedicated cadence sensor
    cadence_crank: Option<CrankBlock>,
    power: Option<PowerValue>,
    trainer: Option<TrainerSample>,
}

impl LatestKnown {
    fn apply_running(&mut self, role: SensorRole, sample: RunningSample) {
        if role == SensorRole::Cadence {
            self.cadence_spm = Some(sample.cadence_spm);
        } else {
            self.rsc = Some(sample);
        }
    }

    fn apply_cycling(&mut self, role: SensorRole, sample: &CyclingSample) {
        let crank = sample.cum_crank_revs.map(|revs| CrankBlock {
            cum_revs: Some(revs),
            last_event_s: sample.last_crank_event_s,
            cadence_rpm: sample.cadence_rpm,
        });

        if role == SensorRole::Cadence {
            if crank.is_some() {
                self.cadence_crank = crank;
            }
            return;
        }

        if let Some(revs) = sample.cum_wheel_revs {
            self.wheel = Some(WheelBlock {
                cum_revs: Some(revs),
                last_event_s: sample.last_wheel_event_s,
                speed_mps: sample.speed_mps,
                rpm: sample.wheel_rpm,
            });
        }
        if crank.is_some() {
            self.crank = crank;
        }
    }

    fn apply_power(&mut self, role: SensorRole, sample: PowerSample, dedicated_meter_up: bool) {
        // a dedicated power meter wins over power reported by a footpod
        if role != SensorRole::Power && dedicated_meter_up {
            return;
        }
        self.power = Some(PowerValue {
            role,
            power_w: sample.power_w,
        });
    }

    /// Drop the fields a channel contributed once its link goes down.
    fn forget(&mut self, role: SensorRole, channel: DataChannel) {
        match (role, channel) {
            (_, DataChannel::Power) => {
                if self.power.is_some_and(|p| p.role == role) {
                    self.power = None;
                }
            }
            (SensorRole::Cadence, _) => {
                self.cadence_spm = None;
                self.cadence_crank = None;
            }
            (SensorRole::Trainer, _) => self.trainer = None,
            (_, DataChannel::SpeedCadence) => {
                self.rsc = None;
                self.wheel = None;
                self.crank = None;
            }
            _ => {}
        }
    }

    fn power_w(&self) -> Option<i32> {
        self.power
            .map(|p| p.power_w)
            .or_else(|| self.trainer.as_ref().and_then(|t| t.power_w))
    }

    fn fuse(&self, sport: Sport, t_s: f64) -> FusedSample {
        let trainer = self.trainer.as_ref();
        match sport {
            Sport::Running => {
                let rsc = self.rsc.as_ref();
                let cadence_spm = self
                    .cadence_spm
                    .or(rsc.map(|r| r.cadence_spm))
                    .or_else(|| {
                        trainer
                            .and_then(|t| t.cadence_rpm)
                            .map(|rpm| rpm.round() as u16)
                    })
                    .unwrap_or(0);
                FusedSample::Running(RunningSample {
                    t_s,
                    speed_mps: rsc
                        .map(|r| r.speed_mps)
                        .or_else(|| trainer.and_then(|t| t.speed_mps))
                        .unwrap_or(0.0),
                    cadence_spm,
                    stride_len_m: rsc.and_then(|r| r.stride_len_m),
                    total_distance_m: rsc
                        .and_then(|r| r.total_distance_m)
                        .or_else(|| trainer.and_then(|t| t.total_distance_m)),
                    is_running: rsc.and_then(|r| r.is_running),
                    power_w: self.power_w(),
                })
            }
            Sport::Cycling => {
                let wheel = self.wheel.unwrap_or_default();
                let crank = self.cadence_crank.or(self.crank).unwrap_or_default();
                FusedSample::Cycling(CyclingSample {
                    t_s,
                    cum_wheel_revs: wheel.cum_revs,
                    last_wheel_event_s: wheel.last_event_s,
                    cum_crank_revs: crank.cum_revs,
                    last_crank_event_s: crank.last_event_s,
                    power_w: self.power_w(),
                    speed_mps: wheel
                        .speed_mps
                        .or_else(|| trainer.and_then(|t| t.speed_mps)),
                    wheel_rpm: wheel.rpm,
                    cadence_rpm: crank
                        .cadence_rpm
                        .or_else(|| trainer.and_then(|t| t.cadence_rpm)),
                    total_distance_m: trainer.and_then(|t| t.total_distance_m),
                })
            }
        }
    }
}

#[derive(Debug)]
struct FusionState {
    latest: LatestKnown,
    links: BTreeMap<(SensorRole, DataChannel), LinkStatus>,
    samples_emitted: u64,
    last_update: Option<Instant>,
}

impl FusionState {
    fn is_up(&self, role: SensorRole, channel: DataChannel) -> bool {
        self.links
            .get(&(role, channel))
            .is_some_and(|status| status.connected)
    }
}

#[derive(Clone)]
struct ControlLink {
    role: SensorRole,
    connection: Arc<dyn BleConnection>,
    /// Distinguishes successive registrations of the same control point
    generation: u64,
}

/// Merges the readings of every configured role into one sample stream.
pub struct FusionEngine {
    sport: Sport,
    state: Mutex<FusionState>,
    router: mpsc::UnboundedSender<RouterInput>,
    events: Sender<SensorEvent>,
    controls: Mutex<HashMap<ControlPoint, ControlLink>>,
    control_generation: AtomicU64,
    control_timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FusionEngine {
    /// Create an engine tracking the primary channel of every role, all
    /// initially down.
    pub fn new(
        sport: Sport,
        roles: &[SensorRole],
        router: mpsc::UnboundedSender<RouterInput>,
        events: Sender<SensorEvent>,
        control_timeout: Duration,
    ) -> Self {
        let links = roles
            .iter()
            .map(|role| {
                let channel = role.primary_channel();
                ((*role, channel), LinkStatus::down(*role, channel))
            })
            .collect();

        Self {
            sport,
            state: Mutex::new(FusionState {
                latest: LatestKnown::default(),
                links,
                samples_emitted: 0,
                last_update: None,
            }),
            router,
            events,
            controls: Mutex::new(HashMap::new()),
            control_generation: AtomicU64::new(0),
            control_timeout,
        }
    }

    pub fn sport(&self) -> Sport {
        self.sport
    }

    /// Merge one reading and forward the result to the router.
    ///
    /// Heart rate passes straight through; everything else produces a fused
    /// sample.
    pub fn ingest(&self, role: SensorRole, reading: Reading) {
        let mut state = lock(&self.state);

        let t_s = match reading {
            Reading::HeartRate(sample) => {
                self.forward(RouterInput::HeartRate(sample));
                return;
            }
            Reading::Running(sample) => {
                let t_s = sample.t_s;
                state.latest.apply_running(role, sample);
                t_s
            }
            Reading::Cycling(sample) => {
                state.latest.apply_cycling(role, &sample);
                sample.t_s
            }
            Reading::Power(sample) => {
                let meter_up = state.is_up(SensorRole::Power, DataChannel::Power);
                state.latest.apply_power(role, sample, meter_up);
                sample.t_s
            }
            Reading::Trainer(sample) => {
                let t_s = sample.t_s;
                state.latest.trainer = Some(sample);
                t_s
            }
        };

        let fused = state.latest.fuse(self.sport, t_s);
        state.samples_emitted += 1;
        state.last_update = Some(Instant::now());
        // sent under the lock to keep producer order
        self.forward(RouterInput::Fused(fused));
    }

    fn forward(&self, input: RouterInput) {
        if self.router.send(input).is_err() {
            tracing::debug!("Sample router is gone, dropping sample");
        }
    }

    /// Record a link transition. Emits a [`SensorEvent::Link`] when the
    /// status actually changed.
    pub fn set_link(
        &self,
        role: SensorRole,
        channel: DataChannel,
        connected: bool,
        error: Option<String>,
    ) {
        let mut state = lock(&self.state);
        let status = LinkStatus {
            role,
            channel,
            connected,
            last_error: if connected { None } else { error },
        };

        if state.links.get(&(role, channel)) == Some(&status) {
            return;
        }
        if !connected {
            state.latest.forget(role, channel);
        }
        tracing::debug!(
            "{} {} link {}",
            role,
            channel,
            if connected { "up" } else { "down" }
        );
        state.links.insert((role, channel), status.clone());
        let _ = self.events.send(SensorEvent::Link(status));
    }

    /// Current status of one channel; unknown channels report down.
    pub fn link_status(&self, role: SensorRole, channel: DataChannel) -> LinkStatus {
        lock(&self.state)
            .links
            .get(&(role, channel))
            .cloned()
            .unwrap_or_else(|| LinkStatus::down(role, channel))
    }

    pub fn links(&self) -> Vec<LinkStatus> {
        lock(&self.state).links.values().cloned().collect()
    }

    /// Whether the primary channel of `role` is up.
    pub fn is_connected(&self, role: SensorRole) -> bool {
        lock(&self.state).is_up(role, role.primary_channel())
    }

    pub fn diagnostics(&self) -> FusionDiagnostics {
        let state = lock(&self.state);
        FusionDiagnostics {
            links: state.links.values().cloned().collect(),
            samples_emitted: state.samples_emitted,
            last_update: state.last_update,
            control_points: lock(&self.controls).keys().copied().collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Control points
    // -----------------------------------------------------------------------

    /// Make a streaming connection's control point available.
    pub fn register_control(
        &self,
        role: SensorRole,
        point: ControlPoint,
        connection: Arc<dyn BleConnection>,
    ) {
        tracing::debug!("{} control point available on {}", role, connection.address());
        let generation = self.control_generation.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.controls).insert(
            point,
            ControlLink {
                role,
                connection,
                generation,
            },
        );
    }

    /// Withdraw a control point registered by `role`.
    pub fn release_control(&self, role: SensorRole, point: ControlPoint) {
        let mut controls = lock(&self.controls);
        if controls.get(&point).is_some_and(|link| link.role == role) {
            controls.remove(&point);
        }
    }

    pub fn has_control(&self, point: ControlPoint) -> bool {
        lock(&self.controls).contains_key(&point)
    }

    /// Registration generation of a control point; changes on every
    /// reconnect.
    pub fn control_generation(&self, point: ControlPoint) -> Option<u64> {
        lock(&self.controls).get(&point).map(|link| link.generation)
    }

    fn control(&self, point: ControlPoint) -> Option<ControlLink> {
        lock(&self.controls).get(&point).cloned()
    }

    /// Write one command and wait for its response. `Ok(None)` means the
    /// device never answered within the control timeout.
    async fn command(
        &self,
        link: &ControlLink,
        point: ControlPoint,
        payload: &[u8],
    ) -> Result<Option<ControlResult>, SensorError> {
        let opcode = payload.first().copied().unwrap_or_default();
        match link
            .connection
            .write_control_point(point.uuid(), payload, self.control_timeout)
            .await
        {
            Ok(response) => Ok(parse_control_response(point, opcode, &response)),
            Err(TransportError::Timeout) => Ok(None),
            Err(e) => Err(SensorError::WriteFailed(e.to_string())),
        }
    }

    async fn request_control(&self, link: &ControlLink) -> Result<bool, SensorError> {
        let result = self
            .command(link, ControlPoint::FitnessMachine, &build_request_control())
            .await?;
        Ok(result.is_some_and(ControlResult::is_success))
    }

    /// Ask the device to zero its cumulative distance.
    ///
    /// Returns `Ok(true)` only when the device acknowledged; no control point,
    /// a timeout or a rejection all return `Ok(false)`.
    pub async fn reset_distance(&self) -> Result<bool, SensorError> {
        if let Some(link) = self.control(ControlPoint::SpeedCadence) {
            tracing::info!("Resetting distance on {} sensor", link.role);
            let result = self
                .command(
                    &link,
                    ControlPoint::SpeedCadence,
                    &build_set_cumulative_value(0),
                )
                .await?;
            return Ok(result.is_some_and(ControlResult::is_success));
        }

        if let Some(link) = self.control(ControlPoint::FitnessMachine) {
            tracing::info!("Resetting trainer");
            if !self.request_control(&link).await? {
                return Ok(false);
            }
            let result = self
                .command(&link, ControlPoint::FitnessMachine, &build_reset())
                .await?;
            return Ok(result.is_some_and(ControlResult::is_success));
        }

        Ok(false)
    }

    /// Apply an ERG target on the trainer.
    pub async fn set_target_power(&self, watts: u16) -> Result<bool, SensorError> {
        let link = self
            .control(ControlPoint::FitnessMachine)
            .ok_or(SensorError::Unsupported)?;
        if !self.request_control(&link).await? {
            return Ok(false);
        }
        let result = self
            .command(
                &link,
                ControlPoint::FitnessMachine,
                &build_set_target_power(watts),
            )
            .await?;
        Ok(result.is_some_and(ControlResult::is_success))
    }
}
