//! Sensor manager: owns the acquisition worker.
//!
//! The worker is a dedicated thread running a current-thread tokio runtime
//! that hosts one link supervisor per configured role, the fusion engine's
//! consumers (router, distance reset, ERG loop) and a command loop. Events
//! reach the caller through a crossbeam channel and never block acquisition.

use crate::recording::reset::{reset_distance_workflow, ResetConfig};
use crate::recording::router::{RouterConfig, RouterInput, SampleRouter};
use crate::recording::types::SamplePersistence;
use crate::sensors::erg::{run_erg_loop, ERG_RETRY_INTERVAL};
use crate::sensors::fusion::FusionEngine;
use crate::sensors::gate::ChannelGate;
use crate::sensors::profile::{ProfileRegistry, ProfileRule};
use crate::sensors::stop::{stop_pair, StopHandle, StopSignal};
use crate::sensors::supervisor::{LinkSupervisor, SupervisorConfig};
use crate::sensors::transport::BleTransport;
use crate::sensors::types::{SensorError, SensorEvent, SensorRole, SessionClock, Sport};
use crossbeam::channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Everything the acquisition worker needs.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub sport: Sport,
    /// One entry per role; unconfigured roles are skipped
    pub roles: Vec<SupervisorConfig>,
    /// Extra name rules, evaluated before the built-in ones
    pub profile_rules: Vec<ProfileRule>,
    pub router: RouterConfig,
    pub reset: ResetConfig,
    /// Wait for a control point response
    pub control_timeout: Duration,
    pub erg_retry_interval: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sport: Sport::default(),
            roles: Vec::new(),
            profile_rules: Vec::new(),
            router: RouterConfig::default(),
            reset: ResetConfig::default(),
            control_timeout: Duration::from_secs(3),
            erg_retry_interval: ERG_RETRY_INTERVAL,
        }
    }
}

impl AcquisitionConfig {
    /// Roles that have a name or an address.
    pub fn configured_roles(&self) -> Vec<SensorRole> {
        self.roles
            .iter()
            .filter(|r| r.is_configured())
            .map(|r| r.role)
            .collect()
    }
}

/// Commands accepted by a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCommand {
    StartRecording,
    StopRecording,
    SetTargetPower(u16),
    ClearTargetPower,
}

struct Worker {
    thread: JoinHandle<()>,
    stop: StopHandle,
    commands: mpsc::UnboundedSender<SensorCommand>,
}

/// Manages the acquisition worker and its event channel.
pub struct SensorManager {
    config: AcquisitionConfig,
    transport: Arc<dyn BleTransport>,
    event_tx: Sender<SensorEvent>,
    event_rx: Receiver<SensorEvent>,
    worker: Option<Worker>,
}

impl SensorManager {
    pub fn new(config: AcquisitionConfig, transport: Arc<dyn BleTransport>) -> Self {
        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        Self {
            config,
            transport,
            event_tx,
            event_rx,
            worker: None,
        }
    }

    /// Receiver for sensor events. Clones share one queue.
    pub fn event_receiver(&self) -> Receiver<SensorEvent> {
        self.event_rx.clone()
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.thread.is_finished())
    }

    /// Spawn the acquisition worker. Does nothing if it is already running.
    pub fn start(&mut self, persistence: Box<dyn SamplePersistence>) -> Result<(), SensorError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let roles = self.config.configured_roles();
        tracing::info!("Starting acquisition for {:?} ({})", roles, self.config.sport);

        let (stop, signal) = stop_pair();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let transport = self.transport.clone();
        let events = self.event_tx.clone();

        let thread = std::thread::Builder::new()
            .name("pacewire-acquisition".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!("Failed to build acquisition runtime: {}", e);
                        let _ = events.send(SensorEvent::Error {
                            role: None,
                            message: SensorError::Runtime(e.to_string()).to_string(),
                        });
                        return;
                    }
                };
                runtime.block_on(run_acquisition(
                    config,
                    transport,
                    persistence,
                    events,
                    commands_rx,
                    signal,
                ));
            })
            .map_err(|e| SensorError::Runtime(e.to_string()))?;

        self.worker = Some(Worker {
            thread,
            stop,
            commands: commands_tx,
        });
        Ok(())
    }

    fn send(&self, command: SensorCommand) -> Result<(), SensorError> {
        let worker = self.worker.as_ref().ok_or(SensorError::NotRunning)?;
        worker
            .commands
            .send(command)
            .map_err(|_| SensorError::NotRunning)
    }

    /// Start recording; also attempts a device distance reset.
    pub fn start_recording(&self) -> Result<(), SensorError> {
        self.send(SensorCommand::StartRecording)
    }

    pub fn stop_recording(&self) -> Result<(), SensorError> {
        self.send(SensorCommand::StopRecording)
    }

    /// Request an ERG target; applied once a trainer is connected.
    pub fn set_target_power(&self, watts: u16) -> Result<(), SensorError> {
        self.send(SensorCommand::SetTargetPower(watts))
    }

    pub fn clear_target_power(&self) -> Result<(), SensorError> {
        self.send(SensorCommand::ClearTargetPower)
    }

    /// Stop every task, close all links and join the worker thread.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            tracing::info!("Shutting down acquisition");
            let _ = worker.commands.send(SensorCommand::StopRecording);
            worker.stop.stop();
            if worker.thread.join().is_err() {
                tracing::error!("Acquisition worker panicked");
            }
        }
    }
}

impl Drop for SensorManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_acquisition(
    config: AcquisitionConfig,
    transport: Arc<dyn BleTransport>,
    persistence: Box<dyn SamplePersistence>,
    events: Sender<SensorEvent>,
    mut commands: mpsc::UnboundedReceiver<SensorCommand>,
    mut stop: StopSignal,
) {
    let clock = SessionClock::new();
    let (router_tx, router_rx) = mpsc::unbounded_channel();
    let fusion = Arc::new(FusionEngine::new(
        config.sport,
        &config.configured_roles(),
        router_tx.clone(),
        events.clone(),
        config.control_timeout,
    ));
    let registry = Arc::new(ProfileRegistry::with_rules(&config.profile_rules));
    let gate = ChannelGate::new();

    let router = SampleRouter::new(config.router, persistence, events.clone());
    let router_task = tokio::spawn(router.run(router_rx, stop.clone()));

    let mut tasks = Vec::new();
    for role_config in config.roles.iter().filter(|r| r.is_configured()) {
        let supervisor = LinkSupervisor::new(
            role_config.clone(),
            transport.clone(),
            gate.clone(),
            fusion.clone(),
            registry.clone(),
            clock,
            events.clone(),
        );
        tasks.push(tokio::spawn(supervisor.run(stop.clone())));
    }

    let (erg_tx, erg_rx) = watch::channel(None);
    tasks.push(tokio::spawn(run_erg_loop(
        fusion.clone(),
        erg_rx,
        events.clone(),
        config.erg_retry_interval,
        stop.clone(),
    )));

    let mut reset_task: Option<tokio::task::JoinHandle<()>> = None;
    loop {
        let command = match stop.run(commands.recv()).await {
            Ok(Some(command)) => command,
            Ok(None) | Err(_) => break,
        };
        tracing::debug!("Command: {:?}", command);
        match command {
            SensorCommand::StartRecording => {
                let _ = router_tx.send(RouterInput::StartRecording);
                if let Some(previous) = reset_task.take() {
                    previous.abort();
                }
                let fusion = fusion.clone();
                let router_tx = router_tx.clone();
                let events = events.clone();
                let reset = config.reset;
                let mut stop = stop.clone();
                reset_task = Some(tokio::spawn(async move {
                    reset_distance_workflow(&fusion, &router_tx, &events, reset, &mut stop).await;
                }));
            }
            SensorCommand::StopRecording => {
                let _ = router_tx.send(RouterInput::StopRecording);
            }
            SensorCommand::SetTargetPower(watts) => {
                erg_tx.send_replace(Some(watts));
            }
            SensorCommand::ClearTargetPower => {
                erg_tx.send_replace(None);
            }
        }
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Acquisition task failed: {}", e);
        }
    }
    // connect attempts abandoned on stop close their links under the gate
    gate.settle().await;
    if let Some(reset) = reset_task {
        reset.abort();
    }
    if let Err(e) = router_task.await {
        tracing::error!("Sample router failed: {}", e);
    }
    let diagnostics = fusion.diagnostics();
    tracing::info!(
        "Acquisition stopped after {} fused samples",
        diagnostics.samples_emitted
    );
}
