//! Subscriber-facing instrument events
//!
//! Everything broadcast on the subscriber address is a tagged
//! [`LiveInstrumentEvent`] whose `data` field holds the JSON-encoded
//! payload record for that event type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::LiveInstrument;
use super::transform::StackTrace;

/// Tag identifying what a subscriber broadcast carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiveInstrumentEventType {
    /// A breakpoint was added
    BreakpointAdded,
    /// A breakpoint fired
    BreakpointHit,
    /// A breakpoint was removed
    BreakpointRemoved,
    /// A log point was added
    LogAdded,
    /// A log point fired
    LogHit,
    /// A log point was removed
    LogRemoved,
}

/// Tagged event envelope published to instrument subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveInstrumentEvent {
    /// What kind of payload `data` holds
    pub event_type: LiveInstrumentEventType,
    /// JSON-encoded payload record
    pub data: String,
}

impl LiveInstrumentEvent {
    /// Build an envelope by JSON-encoding `payload`.
    pub fn new<T: Serialize>(event_type: LiveInstrumentEventType, payload: &T) -> Self {
        Self {
            event_type,
            // Serialization of our own payload types cannot fail.
            data: serde_json::to_string(payload).unwrap_or_default(),
        }
    }
}

/// A structured breakpoint hit: the transformer's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointHit {
    /// Id of the breakpoint that fired
    pub breakpoint_id: String,
    /// Distributed trace id active at the hit
    pub trace_id: String,
    /// When the hit occurred
    pub occurred_at: DateTime<Utc>,
    /// Host the service was running on
    pub service_host: String,
    /// Originating service name
    pub service: String,
    /// Corrected stack trace with variables attached to the top frame
    pub stack_trace: StackTrace,
}

/// A log-point hit, delivered ready-made by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogHit {
    /// Id of the log point that fired
    pub log_id: String,
    /// When the hit occurred
    pub occurred_at: DateTime<Utc>,
    /// Formatted log result payload
    pub log_result: Value,
    /// Host the service was running on
    pub service_host: String,
    /// Originating service name
    pub service: String,
}

/// Terminal removal notice for a breakpoint.
///
/// A `None` cause means operator-initiated removal; otherwise the remote
/// reported a failure (e.g. an exception on the instrumented line).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointRemoved {
    /// Id of the removed breakpoint
    pub breakpoint_id: String,
    /// When the removal occurred
    pub occurred_at: DateTime<Utc>,
    /// Remote-reported failure cause, parsed into stack-trace form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<StackTrace>,
}

/// Terminal removal notice for a log point, carrying its definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRemoved {
    /// Id of the removed log point
    pub log_id: String,
    /// When the removal occurred
    pub occurred_at: DateTime<Utc>,
    /// Remote-reported failure cause, parsed into stack-trace form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<StackTrace>,
    /// The removed log definition
    pub live_log: LiveInstrument,
}
