//! Platform orchestrator and public API
//!
//! Wires the event bus, instrument registry, view service, and expiry
//! sweeper together and exposes them for embedding or for the daemon.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::EventBus;
use crate::error::Result;
use crate::instrument::command::MARKER_DISCONNECTED;
use crate::instrument::expiry::{ExpirySweeper, SweeperHandle};
use crate::instrument::registry::LiveInstrumentRegistry;
use crate::view::service::LiveViewService;

/// Configuration for the Spotlight platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Milliseconds between expiry sweep ticks
    pub expiry_interval_ms: u64,

    /// Whether to run the background sweep loop (tests drive ticks
    /// directly instead)
    pub background_sweep: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            expiry_interval_ms: 1_000,
            background_sweep: true,
        }
    }
}

/// The assembled control plane.
///
/// All components communicate through the shared [`EventBus`]; the
/// platform only owns their lifetimes and the disconnect cleanup wiring.
pub struct Platform {
    config: PlatformConfig,
    bus: EventBus,
    instruments: Arc<LiveInstrumentRegistry>,
    views: Arc<LiveViewService>,
    sweeper: Option<SweeperHandle>,
}

impl Platform {
    /// Start a platform on a fresh event bus.
    pub fn start(config: PlatformConfig) -> Result<Self> {
        Self::start_on(config, EventBus::new())
    }

    /// Start a platform on an existing bus (tests attach fake agents to
    /// the same bus).
    pub fn start_on(config: PlatformConfig, bus: EventBus) -> Result<Self> {
        let instruments = LiveInstrumentRegistry::start(bus.clone());
        let views = LiveViewService::start(bus.clone());

        // The view service clears its own subscriptions on disconnect;
        // instruments need the same signal.
        let registry = instruments.clone();
        let _marker_consumer = bus.consumer(MARKER_DISCONNECTED, move |body: &Value| {
            let Some(developer) = body.get("developer").and_then(Value::as_str) else {
                return;
            };
            match registry.clear_live_instruments(developer) {
                Ok(cleared) => tracing::info!(
                    developer,
                    count = cleared.len(),
                    "cleared live instruments for disconnected marker"
                ),
                Err(err) => tracing::warn!(
                    developer,
                    error = %err,
                    "failed to clear live instruments on disconnect"
                ),
            }
        });

        let sweeper = if config.background_sweep {
            let sweeper = ExpirySweeper::new(
                instruments.clone(),
                Duration::from_millis(config.expiry_interval_ms),
            );
            Some(sweeper.spawn())
        } else {
            None
        };

        Ok(Self {
            config,
            bus,
            instruments,
            views,
            sweeper,
        })
    }

    /// Get the current configuration
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// The shared event bus
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The instrument registry
    pub fn instruments(&self) -> &Arc<LiveInstrumentRegistry> {
        &self.instruments
    }

    /// The view subscription service
    pub fn views(&self) -> &Arc<LiveViewService> {
        &self.views
    }

    /// Stop the sweep loop and close the bus.
    pub fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
        self.bus.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::instrument::model::{LiveInstrument, SourceLocation};

    #[test]
    fn marker_disconnect_clears_developer_instruments() {
        let config = PlatformConfig {
            background_sweep: false,
            ..PlatformConfig::default()
        };
        let platform = Platform::start(config).unwrap();

        platform
            .instruments()
            .add_live_instrument(
                "alice",
                LiveInstrument::breakpoint(SourceLocation::new("Foo", 1)),
                false,
            )
            .unwrap();
        platform
            .instruments()
            .add_live_instrument(
                "bob",
                LiveInstrument::breakpoint(SourceLocation::new("Foo", 2)),
                false,
            )
            .unwrap();

        platform
            .bus()
            .publish(MARKER_DISCONNECTED, json!({"developer": "alice"}))
            .unwrap();
        assert_eq!(platform.instruments().instrument_count(), 1);
    }
}
