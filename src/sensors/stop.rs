//! Process-wide cooperative stop signal.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Owner side of the stop signal.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Cloneable observer of the stop signal, checked at every suspension point.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// Marker returned when a wait was interrupted by the stop signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

/// Create a linked stop handle and signal.
pub fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        // send_replace never fails even without receivers
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the stop signal is raised (or its owner is gone).
    pub async fn stopped(&mut self) {
        // wait_for errors only when the sender is dropped, which also means stop
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration` unless stopped first.
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), Stopped> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Drive `future` to completion unless stopped first.
    pub async fn run<F: Future>(&mut self, future: F) -> Result<F::Output, Stopped> {
        if self.is_stopped() {
            return Err(Stopped);
        }
        tokio::select! {
            _ = self.stopped() => Err(Stopped),
            output = future => Ok(output),
        }
    }
}
