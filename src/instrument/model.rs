//! Live instrument definitions and ownership pairs
//!
//! A live instrument is a breakpoint or log point attached to a source
//! location in running code. The registry stores instruments together with
//! the developer session that registered them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Meta key tracking how many times an instrument has fired.
pub const META_HIT_COUNT: &str = "hit_count";
/// Meta key recording the first hit timestamp (epoch millis, set once).
pub const META_FIRST_HIT: &str = "first_hit";
/// Meta key recording the most recent hit timestamp (epoch millis).
pub const META_LAST_HIT: &str = "last_hit";

/// A qualified source name plus line number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Fully qualified source name (e.g. `com.example.OrderService`)
    pub source: String,
    /// 1-based line number
    pub line: i32,
}

impl SourceLocation {
    /// Create a new source location.
    pub fn new(source: impl Into<String>, line: i32) -> Self {
        Self {
            source: source.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.line)
    }
}

/// Instrument kind discriminant, used for remote-address dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentKind {
    /// Conditional breakpoint capturing stack frames and variables
    Breakpoint,
    /// Structured log point emitting a formatted message
    Log,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKind::Breakpoint => write!(f, "breakpoint"),
            InstrumentKind::Log => write!(f, "log"),
        }
    }
}

/// Kind-specific instrument payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentDetail {
    /// Conditional breakpoint
    Breakpoint,
    /// Structured log point
    #[serde(rename_all = "camelCase")]
    Log {
        /// Message format with `{}` placeholders
        log_format: String,
        /// Expressions filling the placeholders, in order
        log_arguments: Vec<String>,
    },
}

/// A live instrument: breakpoint or log point plus lifecycle bookkeeping.
///
/// Invariants: `applied` and `pending` are never both true, and an
/// instrument without an id is never `applied`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveInstrument {
    /// Unique id, assigned on first successful publish; `None` means the
    /// instrument has never been published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Where the instrument is attached
    pub location: SourceLocation,
    /// Optional guard expression; the instrument only fires when it holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Automatic removal after this many hits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_limit: Option<i32>,
    /// TTL as an epoch-millis deadline; pending instruments past it are
    /// swept away
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Whether the caller blocks until the first confirmation or failure
    #[serde(default)]
    pub apply_immediately: bool,
    /// Confirmed installed on at least one agent
    #[serde(default)]
    pub applied: bool,
    /// Awaiting first remote confirmation
    #[serde(default)]
    pub pending: bool,
    /// Free-form metadata (hit counters, hit timestamps)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    /// Kind-specific payload
    #[serde(flatten)]
    pub detail: InstrumentDetail,
}

impl LiveInstrument {
    /// Create an unpublished breakpoint at `location`.
    pub fn breakpoint(location: SourceLocation) -> Self {
        Self {
            id: None,
            location,
            condition: None,
            hit_limit: None,
            expires_at: None,
            apply_immediately: false,
            applied: false,
            pending: false,
            meta: BTreeMap::new(),
            detail: InstrumentDetail::Breakpoint,
        }
    }

    /// Create an unpublished log point at `location`.
    pub fn log(
        location: SourceLocation,
        log_format: impl Into<String>,
        log_arguments: Vec<String>,
    ) -> Self {
        Self {
            id: None,
            location,
            condition: None,
            hit_limit: None,
            expires_at: None,
            apply_immediately: false,
            applied: false,
            pending: false,
            meta: BTreeMap::new(),
            detail: InstrumentDetail::Log {
                log_format: log_format.into(),
                log_arguments,
            },
        }
    }

    /// The kind discriminant for address dispatch.
    pub fn kind(&self) -> InstrumentKind {
        match self.detail {
            InstrumentDetail::Breakpoint => InstrumentKind::Breakpoint,
            InstrumentDetail::Log { .. } => InstrumentKind::Log,
        }
    }

    /// Copy of this instrument marked applied (`applied=true, pending=false`).
    pub fn as_applied(&self) -> Self {
        let mut applied = self.clone();
        applied.applied = true;
        applied.pending = false;
        applied
    }

    /// Whether the TTL has elapsed relative to `now` (epoch millis).
    pub fn is_expired(&self, now_millis: i64) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now_millis)
    }

    /// Current hit count from meta; zero when the instrument never fired.
    pub fn hit_count(&self) -> i64 {
        self.meta
            .get(META_HIT_COUNT)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    /// Record a hit at `now_millis`, returning the new count.
    ///
    /// `first_hit` is written only on the 0 -> 1 transition; `last_hit` on
    /// every hit.
    pub fn record_hit(&mut self, now_millis: i64) -> i64 {
        let count = self.hit_count() + 1;
        self.meta.insert(META_HIT_COUNT.to_string(), count.to_string());
        if count == 1 {
            self.meta
                .insert(META_FIRST_HIT.to_string(), now_millis.to_string());
        }
        self.meta
            .insert(META_LAST_HIT.to_string(), now_millis.to_string());
        count
    }
}

/// Ownership pair: which developer session registered an instrument.
///
/// Equality and hashing are defined on the instrument alone; two entries
/// with the same instrument collide regardless of owner. This is what lets
/// removal-by-instrument match no matter which session issued the remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperInstrument {
    /// Developer/session id that registered the instrument
    pub self_id: String,
    /// The instrument itself
    pub instrument: LiveInstrument,
}

impl DeveloperInstrument {
    /// Pair an instrument with its owning session.
    pub fn new(self_id: impl Into<String>, instrument: LiveInstrument) -> Self {
        Self {
            self_id: self_id.into(),
            instrument,
        }
    }
}

impl PartialEq for DeveloperInstrument {
    fn eq(&self, other: &Self) -> bool {
        self.instrument == other.instrument
    }
}

impl Eq for DeveloperInstrument {}

impl Hash for DeveloperInstrument {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instrument.hash(state);
    }
}
