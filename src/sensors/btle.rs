//! btleplug implementation of the BLE transport.

use crate::sensors::gatt::{characteristic_name, FTMS_CONTROL_POINT_UUID, SC_CONTROL_POINT_UUID};
use crate::sensors::transport::{
    BleConnection, BleTransport, DeviceFilter, DeviceInfo, LinkEvent, LinkEvents, RawNotification,
    TransportError,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, OnceCell};
use uuid::Uuid;

fn ble_error(e: btleplug::Error) -> TransportError {
    TransportError::from_message(e.to_string())
}

/// Advertised identity and services of a peripheral.
async fn describe(peripheral: &Peripheral) -> Option<(DeviceInfo, Vec<Uuid>)> {
    let properties = peripheral.properties().await.ok()??;
    Some((
        DeviceInfo {
            address: peripheral.id().to_string(),
            name: properties.local_name,
            rssi: properties.rssi,
        },
        properties.services,
    ))
}

fn matches(filter: &DeviceFilter, info: &DeviceInfo, services: &[Uuid]) -> bool {
    (filter.services.is_empty() || services.iter().any(|s| filter.services.contains(s)))
        && filter.matches_name(info.name.as_deref())
}

/// Transport over the first system Bluetooth adapter.
#[derive(Default)]
pub struct BtleTransport {
    adapter: OnceCell<Adapter>,
}

impl BtleTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter, initialized on first use.
    async fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter
            .get_or_try_init(|| async {
                tracing::info!("Initializing BLE adapter");
                let manager = Manager::new().await.map_err(ble_error)?;
                let adapters = manager.adapters().await.map_err(ble_error)?;
                adapters.into_iter().next().ok_or_else(|| {
                    TransportError::AdapterUnavailable("no Bluetooth adapter found".to_string())
                })
            })
            .await
    }

    /// Scan until `accept` picks a peripheral or `timeout` elapses.
    async fn scan_until(
        &self,
        services: Vec<Uuid>,
        timeout: Duration,
        accept: impl Fn(&DeviceInfo, &[Uuid]) -> bool + Send + Sync,
    ) -> Result<Option<DeviceInfo>, TransportError> {
        let adapter = self.adapter().await?;
        let mut events = adapter.events().await.map_err(ble_error)?;
        adapter
            .start_scan(ScanFilter { services })
            .await
            .map_err(ble_error)?;

        let found = tokio::time::timeout(timeout, async {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                if let Some((info, services)) = describe(&peripheral).await {
                    if accept(&info, &services) {
                        return Some(info);
                    }
                }
            }
            None
        })
        .await
        .unwrap_or(None);

        if let Err(e) = adapter.stop_scan().await {
            tracing::debug!("Failed to stop scan: {}", e);
        }
        Ok(found)
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>, TransportError> {
        let adapter = self.adapter().await?;
        let peripherals = adapter.peripherals().await.map_err(ble_error)?;
        Ok(peripherals
            .into_iter()
            .find(|p| p.id().to_string() == address))
    }
}

#[async_trait]
impl BleTransport for BtleTransport {
    async fn scan(
        &self,
        filter: &DeviceFilter,
        timeout: Duration,
    ) -> Result<Option<DeviceInfo>, TransportError> {
        tracing::debug!("Scanning for {:?}", filter);
        self.scan_until(filter.services.clone(), timeout, |info, services| {
            matches(filter, info, services)
        })
        .await
    }

    async fn find_by_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<DeviceInfo>, TransportError> {
        // a cached peripheral with a fresh RSSI is visible right now
        if let Some(peripheral) = self.find_peripheral(address).await? {
            if let Some((info, _)) = describe(&peripheral).await {
                if info.rssi.is_some() {
                    return Ok(Some(info));
                }
            }
        }
        self.scan_until(Vec::new(), timeout, |info, _| info.address == address)
            .await
    }

    async fn connect(
        &self,
        device: &DeviceInfo,
        timeout: Duration,
    ) -> Result<(Arc<dyn BleConnection>, LinkEvents), TransportError> {
        let adapter = self.adapter().await?;
        let peripheral = self.find_peripheral(&device.address).await?.ok_or_else(|| {
            TransportError::Failed(format!("device {} is not known to the adapter", device.address))
        })?;

        tracing::info!("Connecting to {}", device.address);
        let opening = open_link(adapter, &peripheral, device);
        let result = match tokio::time::timeout(timeout, opening).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        if let Err(e) = &result {
            tracing::debug!("Connect to {} failed: {}", device.address, e);
            if let Err(e) = peripheral.disconnect().await {
                tracing::debug!("Disconnect after failed connect: {}", e);
            }
        }
        result
    }
}

/// Connect, discover services and start the notification pumps.
async fn open_link(
    adapter: &Adapter,
    peripheral: &Peripheral,
    device: &DeviceInfo,
) -> Result<(Arc<dyn BleConnection>, LinkEvents), TransportError> {
    let peripheral = peripheral.clone();
    peripheral.connect().await.map_err(ble_error)?;
    peripheral.discover_services().await.map_err(ble_error)?;

    let characteristics: HashMap<Uuid, Characteristic> = peripheral
        .characteristics()
        .into_iter()
        .map(|c| (c.uuid, c))
        .collect();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (responses_tx, responses_rx) = mpsc::unbounded_channel();

    // notification forwarder
    let mut notifications = peripheral.notifications().await.map_err(ble_error)?;
    let forward_tx = events_tx.clone();
    tokio::spawn(async move {
        while let Some(notification) = notifications.next().await {
            if notification.uuid == SC_CONTROL_POINT_UUID
                || notification.uuid == FTMS_CONTROL_POINT_UUID
            {
                let _ = responses_tx.send(notification.value);
                continue;
            }
            let event = LinkEvent::Notification(RawNotification {
                characteristic: notification.uuid,
                bytes: notification.value,
                arrival: Instant::now(),
            });
            if forward_tx.send(event).is_err() {
                break;
            }
        }
        let _ = forward_tx.send(LinkEvent::Disconnected {
            reason: Some("notification stream ended".to_string()),
        });
    });

    // disconnect watcher
    let mut central_events = adapter.events().await.map_err(ble_error)?;
    let id = peripheral.id();
    tokio::spawn(async move {
        while let Some(event) = central_events.next().await {
            if events_tx.is_closed() {
                break;
            }
            if let CentralEvent::DeviceDisconnected(gone) = event {
                if gone == id {
                    let _ = events_tx.send(LinkEvent::Disconnected { reason: None });
                    break;
                }
            }
        }
    });

    let connection = PeripheralLink {
        peripheral,
        address: device.address.clone(),
        characteristics,
        responses: Mutex::new(responses_rx),
        indicating: Mutex::new(HashSet::new()),
    };
    Ok((Arc::new(connection), events_rx))
}

/// A connected btleplug peripheral.
struct PeripheralLink {
    peripheral: Peripheral,
    address: String,
    characteristics: HashMap<Uuid, Characteristic>,
    /// Control point indications; the lock also serializes commands
    responses: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    indicating: Mutex<HashSet<Uuid>>,
}

impl PeripheralLink {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&uuid)
            .ok_or(TransportError::CharacteristicMissing(uuid))
    }
}

#[async_trait]
impl BleConnection for PeripheralLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.characteristics.contains_key(&characteristic)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral.subscribe(target).await.map_err(ble_error)?;
        tracing::debug!("Subscribed to {}", characteristic_name(&characteristic));
        Ok(())
    }

    async fn write_control_point(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let target = self.characteristic(characteristic)?;
        let mut responses = self.responses.lock().await;

        {
            let mut indicating = self.indicating.lock().await;
            if !indicating.contains(&characteristic) {
                self.peripheral.subscribe(target).await.map_err(ble_error)?;
                indicating.insert(characteristic);
            }
        }

        // discard responses to earlier, timed out commands
        while responses.try_recv().is_ok() {}

        self.peripheral
            .write(target, payload, WriteType::WithResponse)
            .await
            .map_err(ble_error)?;

        match tokio::time::timeout(timeout, responses.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        tracing::info!("Disconnecting from {}", self.address);
        match self.peripheral.is_connected().await {
            Ok(false) => Ok(()),
            _ => self.peripheral.disconnect().await.map_err(ble_error),
        }
    }
}
