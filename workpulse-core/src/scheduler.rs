//! Periodic checkpoint driver

use crate::engine::Engine;
use crate::error::Result;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Background thread calling [`Engine::checkpoint_tick`] at a fixed interval.
///
/// The thread exits as soon as the ticker is stopped or dropped.
pub struct CheckpointTicker {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointTicker {
    pub fn spawn(engine: Arc<Engine>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("workpulse-checkpoint".to_string())
            .spawn(move || {
                tracing::debug!(interval_secs = interval.as_secs(), "Checkpoint ticker started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => engine.checkpoint_tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("Checkpoint ticker stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Checkpoint ticker panicked");
            }
        }
    }
}

impl Drop for CheckpointTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
