//! BLE channel serializer.
//!
//! All supervisors share one radio. Scans, visibility probes and connects on
//! a single adapter interfere with each other, so every acquisition-phase
//! operation runs while holding the one [`ChannelGate`]. Notification
//! delivery never takes the gate.

use crate::sensors::types::SensorRole;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Mutual-exclusion gate around scan/connect operations.
#[derive(Debug, Clone, Default)]
pub struct ChannelGate {
    lock: Arc<Mutex<()>>,
}

impl ChannelGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one acquisition operation with exclusive access to the adapter.
    pub async fn exclusive<F: Future>(&self, role: SensorRole, operation: &str, future: F) -> F::Output {
        let waited_from = Instant::now();
        let _guard = self.lock.lock().await;
        let waited = waited_from.elapsed();
        if waited.as_millis() > 0 {
            tracing::debug!(
                "{} waited {:?} for BLE channel before {}",
                role,
                waited,
                operation
            );
        }
        future.await
    }

    /// Wait for every operation queued ahead of this call to finish.
    pub async fn settle(&self) {
        drop(self.lock.lock().await);
    }

    /// Whether some supervisor currently holds the gate.
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}
