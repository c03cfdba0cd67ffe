//! NDJSON operator service for the Spotlight platform.
//!
//! This module exposes a small dispatcher that translates newline-delimited
//! JSON commands into calls on the [`Platform`] components. It backs the
//! `spotlightd` daemon and is intentionally conservative: commands are
//! processed sequentially per connection, and unsupported operations return
//! structured errors.

use crossbeam_channel::{RecvTimeoutError, bounded};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::PROTOCOL_VERSION;
use crate::error::{InstrumentError, PlatformError, ViewError};
use crate::instrument::model::{InstrumentKind, LiveInstrument, SourceLocation};
use crate::platform::Platform;
use crate::view::model::ViewSubscription;

/// Default window an apply-immediately caller waits for confirmation.
const DEFAULT_APPLY_TIMEOUT_MS: u64 = 30_000;

/// Service entry point: wraps a [`Platform`] and serves one connection at
/// a time.
pub struct Service {
    platform: Arc<Platform>,
}

impl Service {
    /// Create a new service over the provided platform.
    pub fn new(platform: Arc<Platform>) -> Self {
        Self { platform }
    }

    /// Process a single connection by consuming requests from the reader
    /// and writing responses.
    pub fn handle<R: BufRead, W: Write>(&mut self, reader: R, writer: W) -> io::Result<()> {
        let mut session = Session::new(self.platform.clone(), writer);
        session.run(reader)
    }
}

struct Session<W: Write> {
    platform: Arc<Platform>,
    writer: W,
    handshake_completed: bool,
    developer: String,
}

impl<W: Write> Session<W> {
    fn new(platform: Arc<Platform>, writer: W) -> Self {
        Self {
            platform,
            writer,
            handshake_completed: false,
            developer: "system".to_string(),
        }
    }

    fn run<R: BufRead>(&mut self, reader: R) -> io::Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let envelope: Result<RequestEnvelope, _> = serde_json::from_str(&line);
            match envelope {
                Ok(request) => {
                    let response = self.handle_request(request);
                    self.write_response(response)?;
                }
                Err(err) => {
                    let response = ResponseEnvelope::from_error(
                        Value::Null,
                        ServiceError::Parse(err.to_string()),
                    );
                    self.write_response(response)?;
                }
            }
        }

        Ok(())
    }

    fn write_response(&mut self, envelope: ResponseEnvelope) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, &envelope)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    fn handle_request(&mut self, request: RequestEnvelope) -> ResponseEnvelope {
        match self.dispatch(&request.command, &request.params) {
            Ok(value) => ResponseEnvelope::success(request.id, value),
            Err(error) => ResponseEnvelope::from_error(request.id, error),
        }
    }

    fn dispatch(&mut self, command: &str, params: &Value) -> Result<Value, ServiceError> {
        if command != "handshake" {
            self.ensure_handshake()?;
        }
        match command {
            "handshake" => self.cmd_handshake(params),
            "status" => self.cmd_status(),
            "add_instrument" => self.cmd_add_instrument(params),
            "get_instruments" => self.cmd_get_instruments(),
            "get_instrument" => self.cmd_get_instrument(params),
            "get_instruments_by_ids" => self.cmd_get_instruments_by_ids(params),
            "get_active_breakpoints" => Ok(instrument_list(
                self.platform.instruments().get_active_live_breakpoints(),
            )),
            "get_active_logs" => Ok(instrument_list(
                self.platform.instruments().get_active_live_logs(),
            )),
            "remove_instrument" => self.cmd_remove_instrument(params),
            "remove_location_instruments" => self.cmd_remove_location_instruments(params),
            "clear_instruments" => self.cmd_clear_instruments(params),
            "add_live_view" => self.cmd_add_live_view(params),
            "update_live_view" => self.cmd_update_live_view(params),
            "remove_live_view" => self.cmd_remove_live_view(params),
            "get_live_view" => self.cmd_get_live_view(params),
            "get_live_views" => self.cmd_get_live_views(),
            "clear_live_views" => self.cmd_clear_live_views(),
            "view_stats" => Ok(json!(self.platform.views().stats())),
            other => Err(ServiceError::Unsupported(other.to_string())),
        }
    }

    fn ensure_handshake(&self) -> Result<(), ServiceError> {
        if self.handshake_completed {
            Ok(())
        } else {
            Err(ServiceError::Protocol(
                "handshake required before issuing commands".into(),
            ))
        }
    }

    fn cmd_handshake(&mut self, params: &Value) -> Result<Value, ServiceError> {
        let client = params
            .get("client")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::invalid_param("client"))?;

        let requested = params
            .get("protocol_version")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::invalid_param("protocol_version"))?;

        if requested != PROTOCOL_VERSION {
            return Err(ServiceError::Protocol(format!(
                "unsupported protocol version: expected {}, got {}",
                PROTOCOL_VERSION, requested
            )));
        }

        if let Some(developer) = params.get("developer").and_then(Value::as_str) {
            self.developer = developer.to_string();
        }
        self.handshake_completed = true;

        Ok(json!({
            "protocol_version": PROTOCOL_VERSION,
            "platform": {
                "version": crate::VERSION,
                "client": client,
                "developer": self.developer,
                "features": [
                    "instruments",
                    "apply_immediately",
                    "live_views",
                    "view_stats"
                ]
            }
        }))
    }

    fn cmd_status(&self) -> Result<Value, ServiceError> {
        Ok(json!({
            "version": crate::VERSION,
            "instruments": self.platform.instruments().instrument_count(),
            "views": self.platform.views().stats(),
        }))
    }

    fn cmd_add_instrument(&mut self, params: &Value) -> Result<Value, ServiceError> {
        let mut instrument: LiveInstrument = parse_param(params, "instrument")?;
        let alert_subscribers = params
            .get("alert_subscribers")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let registry = self.platform.instruments();

        if !instrument.apply_immediately {
            let added = registry.add_live_instrument(&self.developer, instrument, alert_subscribers)?;
            return Ok(json!(added));
        }

        // Pre-assign the id so the waiter can be registered before the
        // command is published; a fast agent must not race the handler in.
        let id = instrument
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let timeout = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_APPLY_TIMEOUT_MS);

        let (sender, receiver) = bounded(1);
        registry.add_apply_immediately_handler(
            id.clone(),
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        );

        if let Err(err) = registry.add_live_instrument(&self.developer, instrument, alert_subscribers)
        {
            registry.cancel_apply_immediately_handler(&id);
            return Err(PlatformError::from(err).into());
        }

        match receiver.recv_timeout(Duration::from_millis(timeout)) {
            Ok(Ok(dev_instrument)) => Ok(json!(dev_instrument.instrument)),
            Ok(Err(err)) => Err(PlatformError::from(err).into()),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                registry.cancel_apply_immediately_handler(&id);
                Err(PlatformError::from(InstrumentError::ApplyTimeout(id)).into())
            }
        }
    }

    fn cmd_get_instruments(&self) -> Result<Value, ServiceError> {
        Ok(instrument_list(
            self.platform.instruments().get_live_instruments(),
        ))
    }

    fn cmd_get_instrument(&self, params: &Value) -> Result<Value, ServiceError> {
        let id = required_str(params, "id")?;
        match self.platform.instruments().get_live_instrument_by_id(id) {
            Some(instrument) => Ok(json!(instrument)),
            None => Err(PlatformError::from(InstrumentError::InvalidInstrumentId(
                id.to_string(),
            ))
            .into()),
        }
    }

    fn cmd_get_instruments_by_ids(&self, params: &Value) -> Result<Value, ServiceError> {
        let ids: Vec<String> = parse_param(params, "ids")?;
        Ok(instrument_list(
            self.platform.instruments().get_live_instruments_by_ids(&ids),
        ))
    }

    fn cmd_remove_instrument(&self, params: &Value) -> Result<Value, ServiceError> {
        let id = required_str(params, "id")?;
        match self
            .platform
            .instruments()
            .remove_live_instrument(&self.developer, id)?
        {
            Some(instrument) => Ok(json!(instrument)),
            None => Err(PlatformError::from(InstrumentError::InvalidInstrumentId(
                id.to_string(),
            ))
            .into()),
        }
    }

    fn cmd_remove_location_instruments(&self, params: &Value) -> Result<Value, ServiceError> {
        let location: SourceLocation = parse_param(params, "location")?;
        let kind: InstrumentKind = parse_param(params, "kind")?;
        let removed =
            self.platform
                .instruments()
                .remove_instruments_at(&self.developer, &location, kind)?;
        Ok(instrument_list(removed))
    }

    fn cmd_clear_instruments(&self, params: &Value) -> Result<Value, ServiceError> {
        let registry = self.platform.instruments();
        let all = params.get("all").and_then(Value::as_bool).unwrap_or(false);
        let kind = params
            .get("kind")
            .map(|value| serde_json::from_value::<InstrumentKind>(value.clone()))
            .transpose()
            .map_err(|_| ServiceError::invalid_param("kind"))?;

        let cleared = if all {
            registry.clear_all_live_instruments(&self.developer)?
        } else {
            match kind {
                Some(InstrumentKind::Breakpoint) => {
                    registry.clear_live_breakpoints(&self.developer)?
                }
                Some(InstrumentKind::Log) => registry.clear_live_logs(&self.developer)?,
                None => registry.clear_live_instruments(&self.developer)?,
            }
        };
        Ok(instrument_list(cleared))
    }

    fn cmd_add_live_view(&self, params: &Value) -> Result<Value, ServiceError> {
        let subscription: ViewSubscription = parse_param(params, "subscription")?;
        let added = self
            .platform
            .views()
            .add_live_view(&self.developer, subscription)?;
        Ok(json!(added))
    }

    fn cmd_update_live_view(&self, params: &Value) -> Result<Value, ServiceError> {
        let id = required_str(params, "id")?;
        let subscription: ViewSubscription = parse_param(params, "subscription")?;
        let updated = self.platform.views().update_live_view(id, subscription)?;
        Ok(json!(updated))
    }

    fn cmd_remove_live_view(&self, params: &Value) -> Result<Value, ServiceError> {
        let id = required_str(params, "id")?;
        let removed = self.platform.views().remove_live_view(id)?;
        Ok(json!(removed))
    }

    fn cmd_get_live_view(&self, params: &Value) -> Result<Value, ServiceError> {
        let id = required_str(params, "id")?;
        let subscription = self.platform.views().get_live_view(id)?;
        Ok(json!(subscription))
    }

    fn cmd_get_live_views(&self) -> Result<Value, ServiceError> {
        Ok(json!(self.platform.views().get_live_views(&self.developer)))
    }

    fn cmd_clear_live_views(&self) -> Result<Value, ServiceError> {
        let cleared = self.platform.views().clear_live_views(&self.developer)?;
        Ok(json!(cleared))
    }
}

fn instrument_list(instruments: Vec<LiveInstrument>) -> Value {
    json!(instruments)
}

fn required_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, ServiceError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::invalid_param(name))
}

fn parse_param<T: serde::de::DeserializeOwned>(
    params: &Value,
    name: &str,
) -> Result<T, ServiceError> {
    let value = params
        .get(name)
        .ok_or_else(|| ServiceError::invalid_param(name))?;
    serde_json::from_value(value.clone()).map_err(|err| {
        ServiceError::InvalidParams(format!("parameter '{name}' is malformed: {err}"))
    })
}

#[derive(Debug)]
enum ServiceError {
    Parse(String),
    InvalidParams(String),
    Unsupported(String),
    Protocol(String),
    Platform(PlatformError),
}

impl ServiceError {
    fn invalid_param(name: &str) -> Self {
        ServiceError::InvalidParams(format!("missing or invalid parameter: {}", name))
    }
}

impl From<PlatformError> for ServiceError {
    fn from(err: PlatformError) -> Self {
        ServiceError::Platform(err)
    }
}

impl From<InstrumentError> for ServiceError {
    fn from(err: InstrumentError) -> Self {
        ServiceError::Platform(err.into())
    }
}

impl From<ViewError> for ServiceError {
    fn from(err: ViewError) -> Self {
        ServiceError::Platform(err.into())
    }
}

#[derive(Deserialize)]
struct RequestEnvelope {
    id: Value,
    command: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct ResponseEnvelope {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEnvelope>,
}

impl ResponseEnvelope {
    fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn from_error(id: Value, error: ServiceError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorEnvelope::from(error)),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl From<ServiceError> for ErrorEnvelope {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Parse(message) => ErrorEnvelope {
                code: "parse_error".into(),
                message,
                details: None,
            },
            ServiceError::InvalidParams(message) => ErrorEnvelope {
                code: "invalid_params".into(),
                message,
                details: None,
            },
            ServiceError::Unsupported(command) => ErrorEnvelope {
                code: "unsupported_command".into(),
                message: format!("Command '{command}' is not supported"),
                details: None,
            },
            ServiceError::Protocol(message) => ErrorEnvelope {
                code: "protocol_error".into(),
                message,
                details: None,
            },
            ServiceError::Platform(err) => {
                let message = err.to_string();
                let (code, details) = match &err {
                    PlatformError::Instrument(InstrumentError::MissingRemote { address }) => (
                        "missing_remote",
                        Some(json!({ "address": address })),
                    ),
                    PlatformError::Instrument(InstrumentError::InvalidInstrumentId(id)) => (
                        "invalid_instrument_id",
                        Some(json!({ "id": id })),
                    ),
                    PlatformError::Instrument(InstrumentError::ApplyTimeout(id)) => {
                        ("apply_timeout", Some(json!({ "id": id })))
                    }
                    PlatformError::Instrument(InstrumentError::RemoteFailure {
                        error_type,
                        message,
                    }) => (
                        "remote_failure",
                        Some(json!({ "errorType": error_type, "message": message })),
                    ),
                    PlatformError::Instrument(InstrumentError::RemovedBeforeApply(id)) => {
                        ("removed_before_apply", Some(json!({ "id": id })))
                    }
                    PlatformError::View(ViewError::InvalidSubscriptionId(id)) => (
                        "invalid_subscription_id",
                        Some(json!({ "id": id })),
                    ),
                    _ => ("platform_error", None),
                };
                ErrorEnvelope {
                    code: code.into(),
                    message,
                    details,
                }
            }
        }
    }
}
