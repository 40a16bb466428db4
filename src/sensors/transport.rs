//! Narrow BLE transport interface used by the acquisition core.
//!
//! Scanning, connecting and characteristic I/O go through [`BleTransport`]
//! and [`BleConnection`]; the btleplug backend and the simulated backend both
//! implement these traits. Notifications and the disconnect callback arrive as
//! [`LinkEvent`]s on the channel returned by `connect`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A device seen by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Adapter-specific address or identifier
    pub address: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
}

/// Filter applied to discovery scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Advertised services, any of which must be present
    pub services: Vec<Uuid>,
    /// Case-insensitive substring of the advertised name
    pub name_contains: Option<String>,
}

impl DeviceFilter {
    /// Whether an advertised name passes the name part of the filter.
    pub fn matches_name(&self, name: Option<&str>) -> bool {
        match &self.name_contains {
            None => true,
            Some(needle) => name
                .map(|n| n.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
        }
    }
}

/// A notification as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    pub characteristic: Uuid,
    pub bytes: Vec<u8>,
    pub arrival: Instant,
}

/// Events delivered for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Notification(RawNotification),
    /// The peripheral dropped the link
    Disconnected { reason: Option<String> },
}

/// Receiving half of a connection's event channel.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// Errors surfaced by a transport backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The adapter is busy with another operation
    #[error("Operation already in progress: {0}")]
    InProgress(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Characteristic {0} not available on device")]
    CharacteristicMissing(Uuid),

    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("{0}")]
    Failed(String),
}

impl TransportError {
    /// Classify a backend error message. BlueZ and CoreBluetooth report a busy
    /// adapter as "InProgress" / "in progress".
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if lowered.contains("inprogress") || lowered.contains("in progress") {
            TransportError::InProgress(message)
        } else {
            TransportError::Failed(message)
        }
    }

    /// Transient errors are retried silently after a short pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::InProgress(_))
    }
}

/// Adapter-level operations.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Run one filtered discovery scan and return the first match.
    async fn scan(
        &self,
        filter: &DeviceFilter,
        timeout: Duration,
    ) -> Result<Option<DeviceInfo>, TransportError>;

    /// Probe for a known address without a general scan.
    async fn find_by_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<DeviceInfo>, TransportError>;

    /// Connect to a device within `timeout`. The returned channel carries
    /// notifications of subscribed characteristics and a final
    /// `Disconnected` event. On any error the device is left disconnected.
    async fn connect(
        &self,
        device: &DeviceInfo,
        timeout: Duration,
    ) -> Result<(Arc<dyn BleConnection>, LinkEvents), TransportError>;
}

/// Operations on one live connection.
#[async_trait]
pub trait BleConnection: Send + Sync {
    fn address(&self) -> &str;

    /// Whether the device exposes a characteristic.
    fn has_characteristic(&self, characteristic: Uuid) -> bool;

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    /// Write a control point command and wait for its response indication.
    async fn write_control_point(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
