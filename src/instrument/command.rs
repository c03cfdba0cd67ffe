//! Remote command protocol and address map
//!
//! Agents are reachable only through kind-specific command addresses on
//! the event bus. Commands carry either full instrument definitions or
//! bare source locations, tagged ADD or REMOVE.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::model::{InstrumentKind, LiveInstrument, SourceLocation};
use crate::bus::{EventBus, PublishOutcome};
use crate::error::BusResult;

/// Outbound add/remove commands for breakpoint agents.
pub const LIVE_BREAKPOINT_REMOTE: &str = "probe.command.breakpoint";
/// Outbound add/remove commands for log agents.
pub const LIVE_LOG_REMOTE: &str = "probe.command.log";
/// Inbound signal that a remote of some kind (re)registered.
pub const PROBE_CONNECTED: &str = "probe.connected";
/// Inbound applied-confirmations for breakpoints.
pub const LIVE_BREAKPOINT_APPLIED: &str = "platform.breakpoint.applied";
/// Inbound applied-confirmations for log points.
pub const LIVE_LOG_APPLIED: &str = "platform.log.applied";
/// Inbound breakpoint removals (agent-reported).
pub const LIVE_BREAKPOINT_REMOVED: &str = "platform.breakpoint.removed";
/// Inbound log-point removals (agent-reported).
pub const LIVE_LOG_REMOVED: &str = "platform.log.removed";
/// Inbound raw breakpoint hits.
pub const BREAKPOINT_HIT: &str = "processor.breakpoint.hit";
/// Inbound ready-made log hits.
pub const LOG_HIT: &str = "processor.log.hit";
/// Outbound tagged instrument events for subscribers.
pub const LIVE_INSTRUMENT_SUBSCRIBER: &str = "subscriber.instrument";
/// Inbound client-disconnected signal carrying a developer id.
pub const MARKER_DISCONNECTED: &str = "platform.marker.disconnected";

/// The remote command address for an instrument kind.
pub fn remote_address(kind: InstrumentKind) -> &'static str {
    match kind {
        InstrumentKind::Breakpoint => LIVE_BREAKPOINT_REMOTE,
        InstrumentKind::Log => LIVE_LOG_REMOTE,
    }
}

/// The applied-confirmation address for an instrument kind.
pub fn applied_address(kind: InstrumentKind) -> &'static str {
    match kind {
        InstrumentKind::Breakpoint => LIVE_BREAKPOINT_APPLIED,
        InstrumentKind::Log => LIVE_LOG_APPLIED,
    }
}

/// The agent-reported removal address for an instrument kind.
pub fn removed_address(kind: InstrumentKind) -> &'static str {
    match kind {
        InstrumentKind::Breakpoint => LIVE_BREAKPOINT_REMOVED,
        InstrumentKind::Log => LIVE_LOG_REMOVED,
    }
}

/// The hit address for an instrument kind.
pub fn hit_address(kind: InstrumentKind) -> &'static str {
    match kind {
        InstrumentKind::Breakpoint => BREAKPOINT_HIT,
        InstrumentKind::Log => LOG_HIT,
    }
}

/// Command verb sent to remote agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    /// Install the instruments in the context
    AddLiveInstrument,
    /// Uninstall the instruments or locations in the context
    RemoveLiveInstrument,
}

/// Context payload of a remote command: full instrument definitions for
/// adds and targeted removes, bare locations for remove-by-location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentContext {
    /// Full instrument definitions
    #[serde(default)]
    pub live_instruments: Vec<LiveInstrument>,
    /// Bare source locations
    #[serde(default)]
    pub locations: Vec<SourceLocation>,
}

/// A command envelope published to a kind-specific remote address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentCommand {
    /// ADD or REMOVE
    pub command_type: CommandType,
    /// What to add or remove
    pub context: InstrumentContext,
}

impl InstrumentCommand {
    /// Command targeting a single instrument definition.
    pub fn for_instrument(command_type: CommandType, instrument: LiveInstrument) -> Self {
        Self {
            command_type,
            context: InstrumentContext {
                live_instruments: vec![instrument],
                locations: Vec::new(),
            },
        }
    }

    /// Command targeting every instrument at a source location.
    pub fn for_location(command_type: CommandType, location: SourceLocation) -> Self {
        Self {
            command_type,
            context: InstrumentContext {
                live_instruments: Vec::new(),
                locations: vec![location],
            },
        }
    }
}

/// Publishes instrument commands to the kind-specific remote addresses.
#[derive(Clone)]
pub struct CommandDispatcher {
    bus: EventBus,
}

impl CommandDispatcher {
    /// Create a dispatcher over `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Publish `command` to the remote address for `kind`.
    ///
    /// Fire-and-forget; the returned outcome tells the caller whether any
    /// agent was connected to receive it.
    pub fn publish(
        &self,
        kind: InstrumentKind,
        command: &InstrumentCommand,
    ) -> BusResult<PublishOutcome> {
        let address = remote_address(kind);
        tracing::trace!(%kind, address, command_type = ?command.command_type, "publishing remote command");
        self.bus.publish(address, json!(command))
    }
}
