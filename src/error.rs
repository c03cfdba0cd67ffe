//! Error types for the Spotlight platform
//!
//! Domain errors use thiserror; conversions to operator-facing envelopes
//! happen at the service boundary.

use thiserror::Error;

/// Top-level platform error
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Instrument lifecycle errors
    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    /// View subscription errors
    #[error("View error: {0}")]
    View(#[from] ViewError),

    /// Event bus transport errors
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Capture payload transformation errors
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience result alias for platform operations
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Instrument lifecycle errors
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// No remote agent is connected for the instrument's kind.
    ///
    /// Only surfaced when the caller requested apply-immediately; otherwise
    /// the instrument is left pending.
    #[error("No remote available to handle address: {address}")]
    MissingRemote {
        /// The remote command address that had no consumer
        address: String,
    },

    /// Operation referenced an unknown instrument id
    #[error("Invalid instrument id: {0}")]
    InvalidInstrumentId(String),

    /// A remote agent reported a failure cause for the instrument
    #[error("Remote failure: {error_type}: {message}")]
    RemoteFailure {
        /// Failure type reported by the remote
        error_type: String,
        /// Failure detail
        message: String,
    },

    /// A removal cause arrived in a format this platform does not recognize
    #[error("Unrecognized removal cause: {0}")]
    UnrecognizedCause(String),

    /// The instrument was removed before any agent confirmed it
    #[error("Instrument {0} was removed before it applied")]
    RemovedBeforeApply(String),

    /// No applied-confirmation arrived within the apply-immediately window
    #[error("Timed out waiting for instrument to apply: {0}")]
    ApplyTimeout(String),

    /// Transport failure while publishing a command
    #[error("Command publish failed: {0}")]
    Bus(#[from] BusError),
}

/// Convenience result alias for instrument operations
pub type InstrumentResult<T> = std::result::Result<T, InstrumentError>;

/// View subscription errors
#[derive(Debug, Error)]
pub enum ViewError {
    /// Operation referenced an unknown subscription id
    #[error("Invalid subscription id: {0}")]
    InvalidSubscriptionId(String),

    /// Transport failure while wiring a view consumer
    #[error("View consumer failed: {0}")]
    Bus(#[from] BusError),
}

/// Convenience result alias for view operations
pub type ViewResult<T> = std::result::Result<T, ViewError>;

/// Event bus transport errors
///
/// Publish outcomes (delivered / no subscriber) are not errors; see
/// [`crate::bus::PublishOutcome`]. These are genuine transport failures.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus has been shut down; no further publishes are accepted
    #[error("Event bus is closed")]
    Closed,
}

/// Convenience result alias for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Errors raised while transforming a raw capture payload
#[derive(Debug, Error)]
pub enum TransformError {
    /// A required field was absent from the payload
    #[error("Capture payload missing field '{0}'")]
    MissingField(&'static str),

    /// A field held a value of an unexpected shape
    #[error("Capture field '{field}' is malformed: {detail}")]
    MalformedField {
        /// Field name
        field: &'static str,
        /// What was wrong with it
        detail: String,
    },

    /// The serialized stack trace could not be parsed
    #[error("Unparseable stack trace: {0}")]
    UnparseableStackTrace(String),

    /// A variable's JSON-encoded value failed to decode
    #[error("Variable '{name}' failed to decode: {source}")]
    VariableDecode {
        /// Variable name
        name: String,
        /// Underlying JSON error
        source: serde_json::Error,
    },
}

/// Convenience result alias for transform operations
pub type TransformResult<T> = std::result::Result<T, TransformError>;

/// A removal cause reported by a remote agent, parsed from the
/// `EventBusException:` wire convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCause {
    /// Failure type (e.g. the exception class on the instrumented line)
    pub error_type: String,
    /// Failure detail
    pub message: String,
}

/// Prefix remotes use when reporting a structured failure cause.
pub const EVENT_BUS_EXCEPTION_PREFIX: &str = "EventBusException";

/// Parse a removal-cause string following the recognized
/// `EventBusException:<type>[<message>]` convention.
///
/// Returns `None` for any other format; callers surface those as
/// [`InstrumentError::UnrecognizedCause`] rather than crashing.
pub fn parse_remote_cause(raw: &str) -> Option<RemoteCause> {
    let rest = raw.strip_prefix(EVENT_BUS_EXCEPTION_PREFIX)?;
    let rest = rest.strip_prefix(':')?;
    let open = rest.find('[')?;
    if !rest.ends_with(']') {
        return None;
    }
    let error_type = rest[..open].trim();
    if error_type.is_empty() {
        return None;
    }
    let message = &rest[open + 1..rest.len() - 1];
    Some(RemoteCause {
        error_type: error_type.to_string(),
        message: message.to_string(),
    })
}

impl InstrumentError {
    /// Build the error for a removal cause string, parsing the recognized
    /// convention and falling back to [`InstrumentError::UnrecognizedCause`].
    pub fn from_removal_cause(raw: &str) -> Self {
        match parse_remote_cause(raw) {
            Some(cause) => InstrumentError::RemoteFailure {
                error_type: cause.error_type,
                message: cause.message,
            },
            None => InstrumentError::UnrecognizedCause(raw.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_bus_exception_causes() {
        let cause = parse_remote_cause(
            "EventBusException:LiveInstrumentException[Expression evaluation failed]",
        )
        .unwrap();
        assert_eq!(cause.error_type, "LiveInstrumentException");
        assert_eq!(cause.message, "Expression evaluation failed");
    }

    #[test]
    fn rejects_unrecognized_causes() {
        assert!(parse_remote_cause("java.lang.NullPointerException").is_none());
        assert!(parse_remote_cause("EventBusException:NoBrackets").is_none());
        assert!(parse_remote_cause("EventBusException:[no type]").is_none());
    }

    #[test]
    fn removal_cause_maps_to_structured_error() {
        let err = InstrumentError::from_removal_cause("EventBusException:Timeout[took too long]");
        assert!(matches!(err, InstrumentError::RemoteFailure { .. }));

        let err = InstrumentError::from_removal_cause("something else entirely");
        assert!(matches!(err, InstrumentError::UnrecognizedCause(_)));
    }
}
