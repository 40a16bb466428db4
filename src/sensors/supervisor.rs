//! Per-role link supervisor.
//!
//! One supervisor runs per configured sensor role and loops through
//! `ResolvingAddress → AwaitingVisibility → Connecting → Streaming →
//! Disconnected/Error → Backoff → ResolvingAddress` until the stop signal is
//! raised. Scans, visibility probes and connects go through the shared
//! [`ChannelGate`]; streaming does not. Every failure path loops back into
//! the state machine.

use crate::sensors::decoder::DecoderConfig;
use crate::sensors::fusion::FusionEngine;
use crate::sensors::gate::ChannelGate;
use crate::sensors::profile::{channel_of, role_services, ProfileKind, ProfileRegistry, SensorProfile};
use crate::sensors::stop::{StopSignal, Stopped};
use crate::sensors::transport::{
    BleConnection, BleTransport, DeviceFilter, DeviceInfo, LinkEvent, LinkEvents, TransportError,
};
use crate::sensors::types::{
    DataChannel, LinkState, SensorError, SensorEvent, SensorRole, SessionClock, Sport,
};
use crossbeam::channel::Sender;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

type Connected = (Arc<dyn BleConnection>, LinkEvents);

/// Timeouts and delays of the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorTiming {
    /// Discovery scan duration
    pub scan_timeout: Duration,
    /// Bounded probe for a known address
    pub visibility_timeout: Duration,
    /// Pause before probing again when the device is not visible
    pub not_visible_delay: Duration,
    pub connect_timeout: Duration,
    /// Pause after a busy-adapter error
    pub in_progress_delay: Duration,
    /// Pause after a disconnect or hard error
    pub backoff: Duration,
    /// Busy-adapter connect failures tolerated before reporting an error
    pub max_transient_retries: u32,
}

impl Default for SupervisorTiming {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(5),
            not_visible_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            in_progress_delay: Duration::from_millis(1500),
            backoff: Duration::from_secs(2),
            max_transient_retries: 5,
        }
    }
}

/// What one supervisor looks for and how it decodes.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub role: SensorRole,
    /// Advertised name to scan for (case-insensitive substring)
    pub name: Option<String>,
    /// Known address; skips the discovery scan
    pub address: Option<String>,
    pub sport: Sport,
    pub decoder: DecoderConfig,
    pub timing: SupervisorTiming,
}

impl SupervisorConfig {
    pub fn new(role: SensorRole) -> Self {
        Self {
            role,
            name: None,
            address: None,
            sport: Sport::default(),
            decoder: DecoderConfig::default(),
            timing: SupervisorTiming::default(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.name.is_some() || self.address.is_some()
    }
}

/// Device resolved for this role, cached for the life of the process.
#[derive(Debug, Clone)]
struct ResolvedDevice {
    address: String,
    name: Option<String>,
    kind: Option<ProfileKind>,
}

/// How a streaming session ended.
enum StreamEnd {
    Disconnected(Option<String>),
    Failed(SensorError),
}

/// Drives one sensor role through connect, stream and retry.
pub struct LinkSupervisor {
    config: SupervisorConfig,
    transport: Arc<dyn BleTransport>,
    gate: ChannelGate,
    fusion: Arc<FusionEngine>,
    registry: Arc<ProfileRegistry>,
    clock: SessionClock,
    events: Sender<SensorEvent>,
    state: LinkState,
    resolved: Option<ResolvedDevice>,
    transient_failures: u32,
}

impl LinkSupervisor {
    pub fn new(
        config: SupervisorConfig,
        transport: Arc<dyn BleTransport>,
        gate: ChannelGate,
        fusion: Arc<FusionEngine>,
        registry: Arc<ProfileRegistry>,
        clock: SessionClock,
        events: Sender<SensorEvent>,
    ) -> Self {
        let resolved = config.address.clone().map(|address| ResolvedDevice {
            address,
            name: config.name.clone(),
            kind: None,
        });
        Self {
            config,
            transport,
            gate,
            fusion,
            registry,
            clock,
            events,
            state: LinkState::Idle,
            resolved,
            transient_failures: 0,
        }
    }

    pub fn role(&self) -> SensorRole {
        self.config.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    fn transition(&mut self, state: LinkState) {
        if self.state == state {
            return;
        }
        tracing::debug!("{}: {:?} -> {:?}", self.config.role, self.state, state);
        self.state = state;
        let _ = self.events.send(SensorEvent::State {
            role: self.config.role,
            state,
        });
    }

    /// Surface a user-visible, non-fatal error.
    fn report(&self, error: &SensorError) {
        tracing::warn!("{}: {}", self.config.role, error);
        let _ = self.events.send(SensorEvent::Error {
            role: Some(self.config.role),
            message: error.to_string(),
        });
    }

    fn mark_down(&self, channel: DataChannel, error: Option<String>) {
        self.fusion.set_link(self.config.role, channel, false, error);
    }

    /// Run until stopped. Leaves no connection open.
    pub async fn run(mut self, mut stop: StopSignal) {
        let role = self.config.role;
        if !self.config.is_configured() {
            self.report(&SensorError::NotConfigured(role));
            return;
        }
        tracing::info!("{} supervisor started", role);

        loop {
            match self.cycle(&mut stop).await {
                Ok(delay) => {
                    self.transition(LinkState::Backoff);
                    if stop.sleep(delay).await.is_err() {
                        break;
                    }
                }
                Err(Stopped) => break,
            }
        }

        self.transition(LinkState::Idle);
        tracing::info!("{} supervisor stopped", role);
    }

    /// One pass from resolution to the end of streaming. Returns the delay
    /// to back off before the next pass.
    async fn cycle(&mut self, stop: &mut StopSignal) -> Result<Duration, Stopped> {
        let timing = self.config.timing;
        self.transition(LinkState::ResolvingAddress);

        let mut resolved = match self.resolved.clone() {
            Some(resolved) => resolved,
            None => match self.scan(stop).await? {
                Ok(Some(device)) => {
                    tracing::info!(
                        "{}: resolved {} ({})",
                        self.config.role,
                        device.name.as_deref().unwrap_or("unnamed"),
                        device.address
                    );
                    let resolved = ResolvedDevice {
                        address: device.address,
                        name: device.name,
                        kind: None,
                    };
                    self.resolved = Some(resolved.clone());
                    resolved
                }
                Ok(None) => {
                    self.report(&SensorError::SensorNotFound {
                        role: self.config.role,
                        name: self.config.name.clone().unwrap_or_default(),
                    });
                    return Ok(timing.backoff);
                }
                Err(e) if e.is_transient() => return Ok(timing.in_progress_delay),
                Err(e) => {
                    self.report(&SensorError::BleError(e.to_string()));
                    return Ok(timing.backoff);
                }
            },
        };

        self.transition(LinkState::AwaitingVisibility);
        let device = loop {
            let address = resolved.address.clone();
            let probe = stop
                .run(self.gate.exclusive(
                    self.config.role,
                    "visibility probe",
                    self.transport
                        .find_by_address(&address, timing.visibility_timeout),
                ))
                .await?;
            match probe {
                Ok(Some(device)) => break device,
                Ok(None) => {
                    tracing::debug!("{}: {} not visible", self.config.role, address);
                    self.mark_down(self.config.role.primary_channel(), None);
                    stop.sleep(timing.not_visible_delay).await?;
                }
                Err(e) if e.is_transient() => stop.sleep(timing.in_progress_delay).await?,
                Err(e) => {
                    self.report(&SensorError::BleError(e.to_string()));
                    return Ok(timing.backoff);
                }
            }
        };

        if resolved.name.is_none() {
            resolved.name = device.name.clone();
        }
        let kind = *resolved.kind.get_or_insert_with(|| {
            self.registry
                .resolve(self.config.role, self.config.sport, resolved.name.as_deref())
        });
        self.resolved = Some(resolved);

        self.transition(LinkState::Connecting);
        let (connection, link_events) = match self.connect(&device, stop).await? {
            Ok(connected) => connected,
            Err(e) if e.is_transient() => {
                self.transient_failures += 1;
                if self.transient_failures > timing.max_transient_retries {
                    self.transient_failures = 0;
                    self.transition(LinkState::Error);
                    self.report(&SensorError::RetriesExhausted(timing.max_transient_retries));
                    return Ok(timing.backoff);
                }
                tracing::debug!("{}: adapter busy, retrying: {}", self.config.role, e);
                return Ok(timing.in_progress_delay);
            }
            Err(e) => {
                self.transition(LinkState::Error);
                let error = SensorError::ConnectionFailed(e.to_string());
                self.report(&error);
                self.mark_down(self.config.role.primary_channel(), Some(error.to_string()));
                return Ok(timing.backoff);
            }
        };
        self.transient_failures = 0;

        if stop.is_stopped() {
            self.close(connection.as_ref()).await;
            return Err(Stopped);
        }

        let end = self.stream(kind, connection, link_events, stop).await?;
        match end {
            StreamEnd::Disconnected(reason) => {
                self.transition(LinkState::Disconnected);
                let message = match reason {
                    Some(reason) => format!("{} sensor disconnected: {}", self.config.role, reason),
                    None => format!("{} sensor disconnected", self.config.role),
                };
                tracing::info!("{}", message);
                let _ = self.events.send(SensorEvent::Error {
                    role: Some(self.config.role),
                    message,
                });
            }
            StreamEnd::Failed(error) => {
                self.transition(LinkState::Error);
                self.report(&error);
            }
        }
        Ok(timing.backoff)
    }

    async fn scan(
        &self,
        stop: &mut StopSignal,
    ) -> Result<Result<Option<DeviceInfo>, TransportError>, Stopped> {
        let filter = DeviceFilter {
            services: role_services(self.config.role),
            name_contains: self.config.name.clone(),
        };
        stop.run(self.gate.exclusive(
            self.config.role,
            "scan",
            self.transport.scan(&filter, self.config.timing.scan_timeout),
        ))
        .await
    }

    /// Connect under the gate. The attempt runs as its own task so a stop
    /// never waits on the adapter; an attempt that completes after the stop
    /// disconnects before it releases the gate.
    async fn connect(
        &self,
        device: &DeviceInfo,
        stop: &mut StopSignal,
    ) -> Result<Result<Connected, TransportError>, Stopped> {
        let role = self.config.role;
        let timeout = self.config.timing.connect_timeout;
        let transport = self.transport.clone();
        let gate = self.gate.clone();
        let device = device.clone();
        let (tx, mut rx) = oneshot::channel();

        tokio::spawn(async move {
            gate.exclusive(role, "connect", async move {
                if tx.is_closed() {
                    return;
                }
                let result = transport.connect(&device, timeout).await;
                if let Err(Ok((connection, _))) = tx.send(result) {
                    tracing::debug!("{}: connect finished after stop, disconnecting", role);
                    if let Err(e) = connection.disconnect().await {
                        tracing::debug!("{}: disconnect failed: {}", role, e);
                    }
                }
            })
            .await;
        });

        match stop.run(&mut rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(Err(TransportError::Failed(
                "connect attempt was dropped".to_string(),
            ))),
            Err(Stopped) => {
                rx.close();
                if let Ok(Ok((connection, _))) = rx.try_recv() {
                    self.close(connection.as_ref()).await;
                }
                Err(Stopped)
            }
        }
    }

    async fn close(&self, connection: &dyn BleConnection) {
        if let Err(e) = connection.disconnect().await {
            tracing::debug!("{}: disconnect failed: {}", self.config.role, e);
        }
    }

    /// Subscribe, then forward decoded notifications until the link drops.
    /// Always disconnects and marks every channel down before returning.
    async fn stream(
        &mut self,
        kind: ProfileKind,
        connection: Arc<dyn BleConnection>,
        mut link_events: LinkEvents,
        stop: &mut StopSignal,
    ) -> Result<StreamEnd, Stopped> {
        let role = self.config.role;
        // fresh decoder state for every connection
        let mut profile = SensorProfile::new(kind, self.config.decoder);
        let mut channels: Vec<DataChannel> = Vec::new();
        let mut failure = None;

        for characteristic in kind.required_characteristics() {
            if let Err(e) = connection.subscribe(*characteristic).await {
                failure = Some(SensorError::SubscriptionFailed(e.to_string()));
                break;
            }
            if let Some(channel) = channel_of(*characteristic) {
                channels.push(channel);
            }
        }

        if failure.is_none() {
            for characteristic in kind.optional_characteristics() {
                if !connection.has_characteristic(*characteristic) {
                    continue;
                }
                match connection.subscribe(*characteristic).await {
                    Ok(()) => channels.extend(channel_of(*characteristic)),
                    Err(e) => tracing::debug!("{}: optional subscription failed: {}", role, e),
                }
            }
        }

        let control = kind
            .control_point()
            .filter(|point| connection.has_characteristic(point.uuid()));

        let end = match failure {
            Some(error) => Ok(StreamEnd::Failed(error)),
            None => {
                for channel in &channels {
                    self.fusion.set_link(role, *channel, true, None);
                }
                if let Some(point) = control {
                    self.fusion.register_control(role, point, connection.clone());
                }
                self.transition(LinkState::Streaming);
                tracing::info!("{}: streaming from {}", role, connection.address());

                loop {
                    match stop.run(link_events.recv()).await {
                        Err(Stopped) => break Err(Stopped),
                        Ok(Some(LinkEvent::Notification(notification))) => {
                            match profile.decode(&notification, &self.clock) {
                                Ok(reading) => self.fusion.ingest(role, reading),
                                Err(e) => tracing::debug!("{}: dropped notification: {}", role, e),
                            }
                        }
                        Ok(Some(LinkEvent::Disconnected { reason })) => {
                            break Ok(StreamEnd::Disconnected(reason))
                        }
                        Ok(None) => {
                            break Ok(StreamEnd::Disconnected(Some(
                                "notification stream closed".to_string(),
                            )))
                        }
                    }
                }
            }
        };

        if let Some(point) = control {
            self.fusion.release_control(role, point);
        }
        let reason = match &end {
            Ok(StreamEnd::Disconnected(reason)) => reason.clone(),
            Ok(StreamEnd::Failed(error)) => Some(error.to_string()),
            Err(Stopped) => None,
        };
        if !channels.contains(&role.primary_channel()) {
            channels.push(role.primary_channel());
        }
        for channel in channels {
            self.mark_down(channel, reason.clone());
        }
        self.close(connection.as_ref()).await;
        end
    }
}
