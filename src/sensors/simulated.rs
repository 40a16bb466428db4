//! In-process BLE transport with scripted devices.
//!
//! Used by the test suites to drive supervisors through disconnects, busy
//! adapters and visibility loss, and by `--simulate` to run the whole
//! pipeline without hardware (see [`spawn_synthetic_feed`]).

use crate::sensors::gatt::{
    CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID, CYCLING_POWER_MEASUREMENT_UUID,
    CYCLING_POWER_SERVICE_UUID, FTMS_CONTROL_POINT_UUID, FTMS_SERVICE_UUID,
    HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
    RSC_MEASUREMENT_UUID, RSC_SERVICE_UUID, SC_CONTROL_POINT_UUID,
};
use crate::sensors::stop::StopSignal;
use crate::sensors::transport::{
    BleConnection, BleTransport, DeviceFilter, DeviceInfo, LinkEvent, LinkEvents, RawNotification,
    TransportError,
};
use crate::sensors::types::Sport;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// How a device answers control point writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlBehavior {
    #[default]
    Acknowledge,
    /// Responds with "operation failed"
    Reject,
    /// Never responds
    Silent,
}

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub info: DeviceInfo,
    pub services: Vec<Uuid>,
    pub characteristics: Vec<Uuid>,
    pub visible: bool,
    pub control: ControlBehavior,
}

impl SimulatedDevice {
    pub fn new(address: &str, name: &str) -> Self {
        Self {
            info: DeviceInfo {
                address: address.to_string(),
                name: Some(name.to_string()),
                rssi: Some(-60),
            },
            services: Vec::new(),
            characteristics: Vec::new(),
            visible: true,
            control: ControlBehavior::default(),
        }
    }

    pub fn with_service(mut self, service: Uuid, characteristics: &[Uuid]) -> Self {
        self.services.push(service);
        self.characteristics.extend_from_slice(characteristics);
        self
    }

    pub fn with_control(mut self, control: ControlBehavior) -> Self {
        self.control = control;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn heart_rate(address: &str, name: &str) -> Self {
        Self::new(address, name).with_service(HEART_RATE_SERVICE_UUID, &[HEART_RATE_MEASUREMENT_UUID])
    }

    /// RSC footpod with SC control point and running power.
    pub fn footpod(address: &str, name: &str) -> Self {
        Self::new(address, name)
            .with_service(RSC_SERVICE_UUID, &[RSC_MEASUREMENT_UUID, SC_CONTROL_POINT_UUID])
            .with_service(CYCLING_POWER_SERVICE_UUID, &[CYCLING_POWER_MEASUREMENT_UUID])
    }

    /// RSC pod without power or control point.
    pub fn cadence_pod(address: &str, name: &str) -> Self {
        Self::new(address, name).with_service(RSC_SERVICE_UUID, &[RSC_MEASUREMENT_UUID])
    }

    pub fn speed_cadence(address: &str, name: &str) -> Self {
        Self::new(address, name)
            .with_service(CSC_SERVICE_UUID, &[CSC_MEASUREMENT_UUID, SC_CONTROL_POINT_UUID])
    }

    pub fn power_meter(address: &str, name: &str) -> Self {
        Self::new(address, name)
            .with_service(CYCLING_POWER_SERVICE_UUID, &[CYCLING_POWER_MEASUREMENT_UUID])
    }

    pub fn trainer(address: &str, name: &str) -> Self {
        Self::new(address, name).with_service(
            FTMS_SERVICE_UUID,
            &[INDOOR_BIKE_DATA_UUID, FTMS_CONTROL_POINT_UUID],
        )
    }
}

/// Operation counters, for asserting on transport usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedStats {
    pub scans: u32,
    pub probes: u32,
    pub connects: u32,
    pub disconnects: u32,
    /// Highest number of scan/probe/connect operations seen at once
    pub max_concurrent_ops: usize,
}

#[derive(Debug)]
struct SimLink {
    id: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
    subscribed: HashSet<Uuid>,
}

#[derive(Debug)]
struct DeviceSlot {
    device: SimulatedDevice,
    connect_failures: VecDeque<TransportError>,
    link: Option<SimLink>,
    writes: Vec<(Uuid, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct SimState {
    devices: Vec<DeviceSlot>,
    next_link: u64,
    active_ops: usize,
    stats: SimulatedStats,
    op_delay: Duration,
}

impl SimState {
    fn slot(&mut self, address: &str) -> Option<&mut DeviceSlot> {
        self.devices
            .iter_mut()
            .find(|slot| slot.device.info.address == address)
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted transport. Clones share the same devices.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make scan, probe and connect take `delay` each.
    pub fn with_op_delay(self, delay: Duration) -> Self {
        lock(&self.state).op_delay = delay;
        self
    }

    pub fn add_device(&self, device: SimulatedDevice) {
        lock(&self.state).devices.push(DeviceSlot {
            device,
            connect_failures: VecDeque::new(),
            link: None,
            writes: Vec::new(),
        });
    }

    pub fn set_visible(&self, address: &str, visible: bool) {
        if let Some(slot) = lock(&self.state).slot(address) {
            slot.device.visible = visible;
        }
    }

    pub fn set_control_behavior(&self, address: &str, control: ControlBehavior) {
        if let Some(slot) = lock(&self.state).slot(address) {
            slot.device.control = control;
        }
    }

    /// Queue an error for the next connect attempt to `address`.
    pub fn fail_next_connect(&self, address: &str, error: TransportError) {
        if let Some(slot) = lock(&self.state).slot(address) {
            slot.connect_failures.push_back(error);
        }
    }

    pub fn is_connected(&self, address: &str) -> bool {
        lock(&self.state)
            .slot(address)
            .is_some_and(|slot| slot.link.is_some())
    }

    /// Whether the device is connected and `characteristic` is subscribed.
    pub fn is_subscribed(&self, address: &str, characteristic: Uuid) -> bool {
        lock(&self.state).slot(address).is_some_and(|slot| {
            slot.link
                .as_ref()
                .is_some_and(|link| link.subscribed.contains(&characteristic))
        })
    }

    /// Deliver a notification. Returns false if nobody is subscribed.
    pub fn notify(&self, address: &str, characteristic: Uuid, bytes: Vec<u8>) -> bool {
        let mut state = lock(&self.state);
        let Some(link) = state.slot(address).and_then(|slot| slot.link.as_ref()) else {
            return false;
        };
        if !link.subscribed.contains(&characteristic) {
            return false;
        }
        link.tx
            .send(LinkEvent::Notification(RawNotification {
                characteristic,
                bytes,
                arrival: Instant::now(),
            }))
            .is_ok()
    }

    /// Drop the link from the peripheral side, firing the disconnect event.
    pub fn drop_link(&self, address: &str, reason: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(link) = state.slot(address).and_then(|slot| slot.link.take()) else {
            return false;
        };
        let _ = link.tx.send(LinkEvent::Disconnected {
            reason: Some(reason.to_string()),
        });
        true
    }

    /// Control point writes received by `address`, oldest first.
    pub fn writes(&self, address: &str) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.state)
            .slot(address)
            .map(|slot| slot.writes.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> SimulatedStats {
        lock(&self.state).stats
    }

    /// Addresses of currently connected devices.
    pub fn connected_addresses(&self) -> Vec<String> {
        lock(&self.state)
            .devices
            .iter()
            .filter(|slot| slot.link.is_some())
            .map(|slot| slot.device.info.address.clone())
            .collect()
    }

    /// Start an adapter operation and return how long it takes.
    fn begin_op(&self) -> Duration {
        let mut state = lock(&self.state);
        state.active_ops += 1;
        state.stats.max_concurrent_ops = state.stats.max_concurrent_ops.max(state.active_ops);
        state.op_delay
    }

    fn finish_op(&self) -> MutexGuard<'_, SimState> {
        let mut state = lock(&self.state);
        state.active_ops -= 1;
        state
    }

    async fn operation<T>(&self, op: impl FnOnce(&mut SimState) -> T) -> T {
        let delay = self.begin_op();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        op(&mut self.finish_op())
    }
}

#[async_trait]
impl BleTransport for SimulatedTransport {
    async fn scan(
        &self,
        filter: &DeviceFilter,
        _timeout: Duration,
    ) -> Result<Option<DeviceInfo>, TransportError> {
        let filter = filter.clone();
        self.operation(move |state| {
            state.stats.scans += 1;
            Ok(state
                .devices
                .iter()
                .filter(|slot| slot.device.visible)
                .filter(|slot| {
                    filter.services.is_empty()
                        || slot.device.services.iter().any(|s| filter.services.contains(s))
                })
                .find(|slot| filter.matches_name(slot.device.info.name.as_deref()))
                .map(|slot| slot.device.info.clone()))
        })
        .await
    }

    async fn find_by_address(
        &self,
        address: &str,
        _timeout: Duration,
    ) -> Result<Option<DeviceInfo>, TransportError> {
        let address = address.to_string();
        self.operation(move |state| {
            state.stats.probes += 1;
            Ok(state
                .slot(&address)
                .filter(|slot| slot.device.visible)
                .map(|slot| slot.device.info.clone()))
        })
        .await
    }

    async fn connect(
        &self,
        device: &DeviceInfo,
        timeout: Duration,
    ) -> Result<(Arc<dyn BleConnection>, LinkEvents), TransportError> {
        let address = device.address.clone();
        let transport = self.clone();
        let delay = self.begin_op();
        tokio::time::sleep(delay.min(timeout)).await;
        let mut guard = self.finish_op();
        let state = &mut *guard;
        state.stats.connects += 1;
        if delay > timeout {
            return Err(TransportError::Timeout);
        }
        let id = state.next_link;
        state.next_link += 1;
        let slot = state
            .slot(&address)
            .ok_or_else(|| TransportError::Failed(format!("unknown device {}", address)))?;
        if let Some(error) = slot.connect_failures.pop_front() {
            return Err(error);
        }
        if !slot.device.visible {
            return Err(TransportError::Failed(format!("{} is out of range", address)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        slot.link = Some(SimLink {
            id,
            tx,
            subscribed: HashSet::new(),
        });
        let connection: Arc<dyn BleConnection> = Arc::new(SimulatedConnection {
            transport,
            address,
            link_id: id,
            characteristics: slot.device.characteristics.clone(),
        });
        Ok((connection, rx))
    }
}

/// One live link to a [`SimulatedDevice`].
struct SimulatedConnection {
    transport: SimulatedTransport,
    address: String,
    link_id: u64,
    characteristics: Vec<Uuid>,
}

impl SimulatedConnection {
    fn with_link<T>(
        &self,
        op: impl FnOnce(&mut DeviceSlot) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = lock(&self.transport.state);
        match state.slot(&self.address) {
            Some(slot) if slot.link.as_ref().is_some_and(|l| l.id == self.link_id) => op(slot),
            _ => Err(TransportError::NotConnected),
        }
    }
}

#[async_trait]
impl BleConnection for SimulatedConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.characteristics.contains(&characteristic)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        if !self.has_characteristic(characteristic) {
            return Err(TransportError::CharacteristicMissing(characteristic));
        }
        self.with_link(|slot| {
            if let Some(link) = slot.link.as_mut() {
                link.subscribed.insert(characteristic);
            }
            Ok(())
        })
    }

    async fn write_control_point(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.has_characteristic(characteristic) {
            return Err(TransportError::CharacteristicMissing(characteristic));
        }
        let control = self.with_link(|slot| {
            slot.writes.push((characteristic, payload.to_vec()));
            Ok(slot.device.control)
        })?;

        let response_opcode = if characteristic == FTMS_CONTROL_POINT_UUID {
            0x80
        } else {
            0x10
        };
        let request = payload.first().copied().unwrap_or_default();
        match control {
            ControlBehavior::Acknowledge => Ok(vec![response_opcode, request, 0x01]),
            ControlBehavior::Reject => Ok(vec![response_opcode, request, 0x04]),
            ControlBehavior::Silent => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.transport.state);
        state.stats.disconnects += 1;
        if let Some(slot) = state.slot(&self.address) {
            if slot.link.as_ref().is_some_and(|l| l.id == self.link_id) {
                slot.link = None;
            }
        }
        Ok(())
    }
}

/// Notification payload builders.
pub mod frames {
    /// Heart Rate Measurement with an 8-bit value, or 16-bit above 255.
    pub fn heart_rate(bpm: u16) -> Vec<u8> {
        match u8::try_from(bpm) {
            Ok(bpm) => vec![0x00, bpm],
            Err(_) => {
                let mut data = vec![0x01];
                data.extend_from_slice(&bpm.to_le_bytes());
                data
            }
        }
    }

    /// RSC Measurement; distance is in meters and encoded in decimeters.
    pub fn rsc(speed_mps: f64, cadence_spm: u8, distance_m: Option<f64>) -> Vec<u8> {
        let mut flags = 0x04;
        if distance_m.is_some() {
            flags |= 0x02;
        }
        let mut data = vec![flags];
        data.extend_from_slice(&((speed_mps * 256.0).round() as u16).to_le_bytes());
        data.push(cadence_spm);
        if let Some(distance) = distance_m {
            data.extend_from_slice(&((distance * 10.0).round() as u32).to_le_bytes());
        }
        data
    }

    /// CSC Measurement from raw counters and 1/1024 s event times.
    pub fn csc(wheel: Option<(u32, u16)>, crank: Option<(u16, u16)>) -> Vec<u8> {
        let mut flags = 0;
        let mut body = Vec::new();
        if let Some((revs, ticks)) = wheel {
            flags |= 0x01;
            body.extend_from_slice(&revs.to_le_bytes());
            body.extend_from_slice(&ticks.to_le_bytes());
        }
        if let Some((revs, ticks)) = crank {
            flags |= 0x02;
            body.extend_from_slice(&revs.to_le_bytes());
            body.extend_from_slice(&ticks.to_le_bytes());
        }
        let mut data = vec![flags];
        data.extend(body);
        data
    }

    pub fn cycling_power(watts: i16) -> Vec<u8> {
        let mut data = vec![0x00, 0x00];
        data.extend_from_slice(&watts.to_le_bytes());
        data
    }

    /// Indoor Bike Data with speed, cadence, distance and power.
    pub fn indoor_bike(speed_kmh: f64, cadence_rpm: f64, distance_m: u32, watts: i16) -> Vec<u8> {
        let flags: u16 = (1 << 2) | (1 << 4) | (1 << 6);
        let mut data = flags.to_le_bytes().to_vec();
        data.extend_from_slice(&((speed_kmh * 100.0).round() as u16).to_le_bytes());
        data.extend_from_slice(&((cadence_rpm * 2.0).round() as u16).to_le_bytes());
        data.extend_from_slice(&distance_m.to_le_bytes()[..3]);
        data.extend_from_slice(&watts.to_le_bytes());
        data
    }
}

/// Device names used by [`demo_transport`].
pub const DEMO_HEART_RATE: &str = "SIM HR";
pub const DEMO_FOOTPOD: &str = "SIM Stryd";
pub const DEMO_SPEED_CADENCE: &str = "SIM Speed CSC";
pub const DEMO_POWER: &str = "SIM Power";

/// A transport populated with one device per demo role.
pub fn demo_transport(sport: Sport) -> SimulatedTransport {
    let transport = SimulatedTransport::new();
    transport.add_device(SimulatedDevice::heart_rate("SIM:00:00:00:00:01", DEMO_HEART_RATE));
    match sport {
        Sport::Running => {
            transport.add_device(SimulatedDevice::footpod("SIM:00:00:00:00:02", DEMO_FOOTPOD));
        }
        Sport::Cycling => {
            transport.add_device(SimulatedDevice::speed_cadence(
                "SIM:00:00:00:00:03",
                DEMO_SPEED_CADENCE,
            ));
            transport.add_device(SimulatedDevice::power_meter("SIM:00:00:00:00:04", DEMO_POWER));
        }
    }
    transport
}

/// Feed plausible notifications to every connected demo device once per
/// `interval` until stopped.
pub async fn spawn_synthetic_feed(
    transport: SimulatedTransport,
    interval: Duration,
    mut stop: StopSignal,
) {
    let mut tick: u32 = 0;
    let mut distance_m = 1234.0_f64;
    let mut wheel_revs: u32 = 10_000;
    let mut crank_revs: u16 = 500;

    loop {
        if stop.sleep(interval).await.is_err() {
            break;
        }
        tick = tick.wrapping_add(1);
        let wave = f64::from(tick % 20) / 20.0;
        let event_ticks = (tick.wrapping_mul(1024) % 65_536) as u16;

        let bpm = 135 + (wave * 12.0) as u16;
        let speed_mps = 3.2 + wave * 0.4;
        distance_m += speed_mps * interval.as_secs_f64();
        wheel_revs = wheel_revs.wrapping_add(4);
        crank_revs = crank_revs.wrapping_add(1);

        for address in transport.connected_addresses() {
            transport.notify(&address, HEART_RATE_MEASUREMENT_UUID, frames::heart_rate(bpm));
            transport.notify(
                &address,
                RSC_MEASUREMENT_UUID,
                frames::rsc(speed_mps, 172 + (tick % 4) as u8, Some(distance_m)),
            );
            transport.notify(
                &address,
                CSC_MEASUREMENT_UUID,
                frames::csc(Some((wheel_revs, event_ticks)), Some((crank_revs, event_ticks))),
            );
            transport.notify(
                &address,
                CYCLING_POWER_MEASUREMENT_UUID,
                frames::cycling_power(220 + (wave * 40.0) as i16),
            );
        }
    }
}
