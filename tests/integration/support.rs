//! Shared helpers for driving supervisors against the simulated transport.

use pacewire::recording::RouterInput;
use pacewire::sensors::{
    stop_pair, ChannelGate, FusionEngine, LinkSupervisor, ProfileRegistry, SensorEvent,
    SensorRole, SessionClock, SimulatedTransport, Sport, StopHandle, SupervisorConfig,
    SupervisorTiming,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Supervisor timings short enough for tests.
pub fn fast_timing() -> SupervisorTiming {
    SupervisorTiming {
        scan_timeout: Duration::from_millis(50),
        visibility_timeout: Duration::from_millis(50),
        not_visible_delay: Duration::from_millis(20),
        connect_timeout: Duration::from_millis(500),
        in_progress_delay: Duration::from_millis(10),
        backoff: Duration::from_millis(20),
        max_transient_retries: 5,
    }
}

pub fn role_config(role: SensorRole, sport: Sport, name: &str) -> SupervisorConfig {
    SupervisorConfig {
        name: Some(name.to_string()),
        sport,
        timing: fast_timing(),
        ..SupervisorConfig::new(role)
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Blocking variant of [`eventually`] for tests that drive a
/// `SensorManager` from the outside.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Supervisors sharing one fusion engine, gate and transport.
pub struct Rig {
    pub transport: SimulatedTransport,
    pub fusion: Arc<FusionEngine>,
    pub gate: ChannelGate,
    pub router: mpsc::UnboundedReceiver<RouterInput>,
    pub events: crossbeam::channel::Receiver<SensorEvent>,
    events_tx: crossbeam::channel::Sender<SensorEvent>,
    registry: Arc<ProfileRegistry>,
    clock: SessionClock,
    stop: StopHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Rig {
    pub fn new(transport: SimulatedTransport, sport: Sport, roles: &[SensorRole]) -> Self {
        let (router_tx, router) = mpsc::unbounded_channel();
        let (events_tx, events) = crossbeam::channel::unbounded();
        let fusion = Arc::new(FusionEngine::new(
            sport,
            roles,
            router_tx,
            events_tx.clone(),
            Duration::from_millis(100),
        ));
        let (stop, _) = stop_pair();
        Self {
            transport,
            fusion,
            gate: ChannelGate::new(),
            router,
            events,
            events_tx,
            registry: Arc::new(ProfileRegistry::default()),
            clock: SessionClock::new(),
            stop,
            tasks: Vec::new(),
        }
    }

    pub fn spawn(&mut self, config: SupervisorConfig) {
        let supervisor = LinkSupervisor::new(
            config,
            Arc::new(self.transport.clone()),
            self.gate.clone(),
            self.fusion.clone(),
            self.registry.clone(),
            self.clock,
            self.events_tx.clone(),
        );
        self.tasks
            .push(tokio::spawn(supervisor.run(self.stop.signal())));
    }

    /// Every event received so far.
    pub fn drain_events(&self) -> Vec<SensorEvent> {
        self.events.try_iter().collect()
    }

    /// Raise the stop signal and wait for every supervisor to return.
    pub async fn shutdown(self) {
        self.stop.stop();
        for task in self.tasks {
            tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .expect("supervisor did not stop")
                .expect("supervisor panicked");
        }
    }
}
