//! Periodic TTL sweep for pending instruments
//!
//! Instruments carrying an `expires_at` deadline that are still pending
//! when it passes are force-removed through the normal remove path. The
//! sweep runs on a fixed period independent of message traffic; an empty
//! registry is a cheap no-op.

use chrono::Utc;
use crossbeam_channel::{Sender, bounded, select, tick};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::registry::LiveInstrumentRegistry;

/// Fixed-interval sweeper over the instrument registry.
pub struct ExpirySweeper {
    registry: Arc<LiveInstrumentRegistry>,
    interval: Duration,
}

impl ExpirySweeper {
    /// Create a sweeper over `registry` ticking every `interval`.
    pub fn new(registry: Arc<LiveInstrumentRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Run a single sweep pass at `now_millis`, returning how many
    /// instruments were removed. Exposed so tests can drive time directly.
    pub fn tick(&self, now_millis: i64) -> usize {
        self.registry.sweep_expired(now_millis).len()
    }

    /// Run the sweep loop on a background thread until stopped.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let thread = std::thread::spawn(move || {
            let ticker = tick(self.interval);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        let removed = self.tick(Utc::now().timestamp_millis());
                        if removed > 0 {
                            tracing::debug!(removed, "expiry sweep removed instruments");
                        }
                    }
                    recv(shutdown_rx) -> _ => break,
                }
            }
        });
        SweeperHandle {
            shutdown: shutdown_tx,
            thread: Some(thread),
        }
    }
}

/// Handle to a running sweep loop.
pub struct SweeperHandle {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signal the loop to stop and wait for the thread to exit.
    pub fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        // Best effort; the loop also exits when the sender disconnects.
        let _ = self.shutdown.try_send(());
    }
}
