//! Live instrument registry and lifecycle state machine
//!
//! Single source of truth for instrument state: pending instruments await
//! remote confirmation, applied instruments are confirmed installed, and
//! removal is terminal. The registry consumes agent events from the bus
//! (applied confirmations, agent-reported removals, hits, reconnects) and
//! publishes commands and subscriber broadcasts back onto it.
//!
//! Lock discipline: the instrument set is mutated under its write lock and
//! every bus publish happens after the lock is released, so consumer
//! handlers may call back into the registry freely.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::command::{
    self, CommandDispatcher, CommandType, InstrumentCommand, LIVE_INSTRUMENT_SUBSCRIBER,
};
use super::event::{
    BreakpointRemoved, LiveInstrumentEvent, LiveInstrumentEventType, LogHit, LogRemoved,
};
use super::model::{DeveloperInstrument, InstrumentKind, LiveInstrument, SourceLocation};
use super::transform::{StackTrace, transform_raw_breakpoint_hit};
use super::waiting::{ApplyHandler, ApplyWaitRegistry};
use crate::bus::{ConsumerHandle, EventBus, PublishOutcome};
use crate::error::{InstrumentError, InstrumentResult};

/// Developer id used for platform-initiated removals (TTL expiry).
pub const SYSTEM_DEVELOPER: &str = "system";

/// Concurrent set of developer/instrument pairs plus the bus wiring that
/// drives the lifecycle state machine.
pub struct LiveInstrumentRegistry {
    bus: EventBus,
    dispatcher: CommandDispatcher,
    instruments: RwLock<HashSet<DeveloperInstrument>>,
    waiting_apply: ApplyWaitRegistry,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

impl LiveInstrumentRegistry {
    /// Create the registry and register its bus consumers.
    pub fn start(bus: EventBus) -> Arc<Self> {
        let registry = Arc::new(Self {
            dispatcher: CommandDispatcher::new(bus.clone()),
            bus,
            instruments: RwLock::new(HashSet::new()),
            waiting_apply: ApplyWaitRegistry::new(),
            consumers: Mutex::new(Vec::new()),
        });
        registry.register_consumers();
        registry
    }

    fn register_consumers(self: &Arc<Self>) {
        let mut handles = Vec::new();

        handles.push(self.on_bus(command::PROBE_CONNECTED, |registry, body| {
            registry.handle_probe_connected(body);
        }));
        for kind in [InstrumentKind::Breakpoint, InstrumentKind::Log] {
            handles.push(self.on_bus(command::applied_address(kind), move |registry, body| {
                registry.handle_applied(body);
            }));
            handles.push(self.on_bus(command::removed_address(kind), move |registry, body| {
                registry.handle_agent_removed(kind, body);
            }));
        }
        handles.push(self.on_bus(command::BREAKPOINT_HIT, |registry, body| {
            registry.handle_breakpoint_hit(body);
        }));
        handles.push(self.on_bus(command::LOG_HIT, |registry, body| {
            registry.handle_log_hit(body);
        }));

        *self.consumers.lock() = handles;
    }

    fn on_bus(
        self: &Arc<Self>,
        address: &str,
        handler: impl Fn(&Self, &Value) + Send + Sync + 'static,
    ) -> ConsumerHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.consumer(address, move |body| {
            if let Some(registry) = weak.upgrade() {
                handler(&registry, body);
            }
        })
    }

    // --- Operator-facing operations ---

    /// Add a live instrument for `self_id`, assigning an id when absent.
    ///
    /// The instrument is inserted as pending and an ADD command published
    /// to its kind-specific remote address. With no agent connected the add
    /// fails only when `apply_immediately` was requested; otherwise the
    /// instrument stays pending until an agent connects.
    pub fn add_live_instrument(
        &self,
        self_id: &str,
        mut instrument: LiveInstrument,
        alert_subscribers: bool,
    ) -> InstrumentResult<LiveInstrument> {
        if instrument.id.is_none() {
            instrument.id = Some(Uuid::new_v4().to_string());
        }
        instrument.pending = true;
        instrument.applied = false;
        let kind = instrument.kind();
        tracing::debug!(%kind, id = ?instrument.id, location = %instrument.location, "adding live instrument");

        let dev_instrument = DeveloperInstrument::new(self_id, instrument.clone());
        self.instruments.write().insert(dev_instrument.clone());

        let command =
            InstrumentCommand::for_instrument(CommandType::AddLiveInstrument, instrument.clone());
        match self.dispatcher.publish(kind, &command) {
            Ok(outcome) if outcome.is_delivered() => {}
            Ok(_) => {
                if instrument.apply_immediately {
                    self.instruments.write().remove(&dev_instrument);
                    tracing::warn!(%kind, "live instrument failed due to missing remote");
                    return Err(InstrumentError::MissingRemote {
                        address: command::remote_address(kind).to_string(),
                    });
                }
                tracing::info!(%kind, "live instrument pending application on probe connection");
            }
            Err(err) => {
                self.instruments.write().remove(&dev_instrument);
                tracing::warn!(%kind, error = %err, "failed to publish add command");
                return Err(err.into());
            }
        }

        if alert_subscribers {
            self.broadcast(LiveInstrumentEvent::new(
                added_event_type(kind),
                &instrument,
            ));
        }
        Ok(instrument)
    }

    /// Register a one-shot handler resolved by the first applied
    /// confirmation or removal for `instrument_id`.
    pub fn add_apply_immediately_handler(
        &self,
        instrument_id: impl Into<String>,
        handler: ApplyHandler,
    ) {
        self.waiting_apply.register(instrument_id, handler);
    }

    /// Drop an apply-immediately handler without resolving it.
    pub fn cancel_apply_immediately_handler(&self, instrument_id: &str) {
        self.waiting_apply.cancel(instrument_id);
    }

    /// All instruments currently tracked, in no particular order.
    pub fn get_live_instruments(&self) -> Vec<LiveInstrument> {
        self.instruments
            .read()
            .iter()
            .map(|dev| dev.instrument.clone())
            .collect()
    }

    /// Look up a single instrument by id.
    pub fn get_live_instrument_by_id(&self, id: &str) -> Option<LiveInstrument> {
        self.instruments
            .read()
            .iter()
            .find(|dev| dev.instrument.id.as_deref() == Some(id))
            .map(|dev| dev.instrument.clone())
    }

    /// Look up several instruments by id; unknown ids are skipped.
    pub fn get_live_instruments_by_ids(&self, ids: &[String]) -> Vec<LiveInstrument> {
        let instruments = self.instruments.read();
        ids.iter()
            .filter_map(|id| {
                instruments
                    .iter()
                    .find(|dev| dev.instrument.id.as_deref() == Some(id.as_str()))
                    .map(|dev| dev.instrument.clone())
            })
            .collect()
    }

    /// Breakpoints that have been confirmed on at least one agent.
    pub fn get_active_live_breakpoints(&self) -> Vec<LiveInstrument> {
        self.instruments_of_kind(InstrumentKind::Breakpoint, false)
    }

    /// Log points that have been confirmed on at least one agent.
    pub fn get_active_live_logs(&self) -> Vec<LiveInstrument> {
        self.instruments_of_kind(InstrumentKind::Log, false)
    }

    fn instruments_of_kind(&self, kind: InstrumentKind, pending: bool) -> Vec<LiveInstrument> {
        self.instruments
            .read()
            .iter()
            .filter(|dev| dev.instrument.kind() == kind && dev.instrument.pending == pending)
            .map(|dev| dev.instrument.clone())
            .collect()
    }

    /// Remove an instrument by id. `Ok(None)` when the id is unknown.
    pub fn remove_live_instrument(
        &self,
        self_id: &str,
        instrument_id: &str,
    ) -> InstrumentResult<Option<LiveInstrument>> {
        tracing::trace!(instrument_id, "removing live instrument");
        let found = self
            .instruments
            .read()
            .iter()
            .find(|dev| dev.instrument.id.as_deref() == Some(instrument_id))
            .cloned();
        match found {
            Some(dev) => {
                self.remove_internal(self_id, Utc::now(), dev.instrument.clone(), None)?;
                Ok(Some(dev.instrument))
            }
            None => Ok(None),
        }
    }

    /// Remove a tracked developer/instrument pair.
    ///
    /// An instrument that was never published (no id) is a pure local
    /// delete; nothing is sent to agents or subscribers.
    pub fn remove_developer_instrument(
        &self,
        dev_instrument: DeveloperInstrument,
    ) -> InstrumentResult<LiveInstrument> {
        if dev_instrument.instrument.id.is_none() {
            self.instruments.write().remove(&dev_instrument);
            return Ok(dev_instrument.instrument);
        }
        self.remove_internal(
            &dev_instrument.self_id,
            Utc::now(),
            dev_instrument.instrument.clone(),
            None,
        )?;
        Ok(dev_instrument.instrument)
    }

    /// Remove every instrument of `kind` at `location`.
    ///
    /// Publishes a single location-targeted REMOVE command; returns the
    /// removed definitions (empty when none matched).
    pub fn remove_instruments_at(
        &self,
        self_id: &str,
        location: &SourceLocation,
        kind: InstrumentKind,
    ) -> InstrumentResult<Vec<LiveInstrument>> {
        tracing::debug!(%kind, %location, self_id, "removing live instruments at location");
        let removed: Vec<DeveloperInstrument> = {
            let mut instruments = self.instruments.write();
            let matches: Vec<DeveloperInstrument> = instruments
                .iter()
                .filter(|dev| {
                    dev.instrument.location == *location && dev.instrument.kind() == kind
                })
                .cloned()
                .collect();
            for dev in &matches {
                instruments.remove(dev);
            }
            matches
        };

        if removed.is_empty() {
            tracing::info!(%kind, %location, "no live instruments found at location");
            return Ok(Vec::new());
        }

        let command =
            InstrumentCommand::for_location(CommandType::RemoveLiveInstrument, location.clone());
        let _ = self.dispatcher.publish(kind, &command)?;

        let definitions: Vec<LiveInstrument> =
            removed.into_iter().map(|dev| dev.instrument).collect();
        self.broadcast(LiveInstrumentEvent::new(
            removed_event_type(kind),
            &definitions,
        ));
        Ok(definitions)
    }

    /// Remove every tracked instrument, regardless of owner.
    pub fn clear_all_live_instruments(&self, self_id: &str) -> InstrumentResult<Vec<LiveInstrument>> {
        self.clear_matching(self_id, |_| true)
    }

    /// Remove every instrument owned by `self_id`.
    pub fn clear_live_instruments(&self, self_id: &str) -> InstrumentResult<Vec<LiveInstrument>> {
        self.clear_matching(self_id, move |dev| dev.self_id == self_id)
    }

    /// Remove every breakpoint owned by `self_id`.
    pub fn clear_live_breakpoints(&self, self_id: &str) -> InstrumentResult<Vec<LiveInstrument>> {
        self.clear_matching(self_id, move |dev| {
            dev.self_id == self_id && dev.instrument.kind() == InstrumentKind::Breakpoint
        })
    }

    /// Remove every log point owned by `self_id`.
    pub fn clear_live_logs(&self, self_id: &str) -> InstrumentResult<Vec<LiveInstrument>> {
        self.clear_matching(self_id, move |dev| {
            dev.self_id == self_id && dev.instrument.kind() == InstrumentKind::Log
        })
    }

    // Bulk clears are repeated single removals; no batch remote protocol
    // exists.
    fn clear_matching(
        &self,
        self_id: &str,
        filter: impl Fn(&DeveloperInstrument) -> bool,
    ) -> InstrumentResult<Vec<LiveInstrument>> {
        let targets: Vec<DeveloperInstrument> = self
            .instruments
            .read()
            .iter()
            .filter(|dev| filter(dev))
            .cloned()
            .collect();

        tracing::trace!(self_id, count = targets.len(), "clearing live instruments");
        let mut removed = Vec::with_capacity(targets.len());
        for dev in targets {
            removed.push(self.remove_developer_instrument(dev)?);
        }
        Ok(removed)
    }

    /// Force-remove pending instruments whose TTL elapsed before `now`.
    ///
    /// Called by the expiry sweeper; uses the normal remove path with the
    /// system developer id.
    pub fn sweep_expired(&self, now_millis: i64) -> Vec<LiveInstrument> {
        let expired: Vec<DeveloperInstrument> = {
            let instruments = self.instruments.read();
            if instruments.is_empty() {
                return Vec::new();
            }
            instruments
                .iter()
                .filter(|dev| dev.instrument.pending && dev.instrument.is_expired(now_millis))
                .cloned()
                .collect()
        };

        let mut removed = Vec::with_capacity(expired.len());
        for dev in expired {
            tracing::info!(id = ?dev.instrument.id, "removing expired live instrument");
            let dev = DeveloperInstrument::new(SYSTEM_DEVELOPER, dev.instrument);
            match self.remove_developer_instrument(dev) {
                Ok(instrument) => removed.push(instrument),
                Err(err) => tracing::warn!(error = %err, "failed to remove expired instrument"),
            }
        }
        removed
    }

    /// Number of currently tracked instruments.
    pub fn instrument_count(&self) -> usize {
        self.instruments.read().len()
    }

    // --- Inbound agent events ---

    fn handle_probe_connected(&self, body: &Value) {
        let Some(remote) = body.get("address").and_then(Value::as_str) else {
            tracing::warn!("probe-connected signal missing remote address");
            return;
        };
        let kind = match remote {
            command::LIVE_BREAKPOINT_REMOTE => InstrumentKind::Breakpoint,
            command::LIVE_LOG_REMOTE => InstrumentKind::Log,
            other => {
                tracing::trace!(address = other, "ignoring unrelated remote registration");
                return;
            }
        };

        let pending = self.instruments_of_kind(kind, true);
        tracing::debug!(%kind, count = pending.len(), "remote registered; resending pending live instruments");
        for instrument in pending {
            let command =
                InstrumentCommand::for_instrument(CommandType::AddLiveInstrument, instrument);
            if let Err(err) = self.dispatcher.publish(kind, &command) {
                tracing::warn!(%kind, error = %err, "failed to resend pending instrument");
            }
        }
    }

    fn handle_applied(&self, body: &Value) {
        let instrument: LiveInstrument = match serde_json::from_value(body.clone()) {
            Ok(instrument) => instrument,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable applied confirmation");
                return;
            }
        };
        let Some(id) = instrument.id.clone() else {
            tracing::warn!("applied confirmation without instrument id");
            return;
        };

        let applied_pair = {
            let mut instruments = self.instruments.write();
            let existing = instruments
                .iter()
                .find(|dev| dev.instrument.id.as_deref() == Some(id.as_str()))
                .cloned();
            match existing {
                Some(dev) => {
                    instruments.remove(&dev);
                    let applied =
                        DeveloperInstrument::new(dev.self_id, dev.instrument.as_applied());
                    instruments.insert(applied.clone());
                    Some(applied)
                }
                None => None,
            }
        };

        if let Some(applied) = applied_pair {
            tracing::info!(%id, "live instrument applied");
            self.waiting_apply.resolve(&id, Ok(applied));
        }
    }

    fn handle_agent_removed(&self, kind: InstrumentKind, body: &Value) {
        tracing::trace!(%kind, "got agent-reported instrument removal");
        let instrument_id = match removed_instrument_id(kind, body) {
            Some(id) => id,
            None => {
                tracing::warn!(%kind, "undecodable agent removal payload");
                return;
            }
        };

        let occurred_at = body
            .get("occurredAt")
            .and_then(Value::as_i64)
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(Utc::now);
        let cause = body.get("cause").and_then(Value::as_str);

        let found = self
            .instruments
            .read()
            .iter()
            .find(|dev| dev.instrument.id.as_deref() == Some(instrument_id.as_str()))
            .cloned();
        if let Some(dev) = found {
            let DeveloperInstrument {
                self_id,
                instrument,
            } = dev;
            if let Err(err) = self.remove_internal(&self_id, occurred_at, instrument, cause) {
                tracing::warn!(error = %err, "failed to process agent removal");
            }
        }
    }

    fn handle_breakpoint_hit(&self, body: &Value) {
        let hit = match transform_raw_breakpoint_hit(body) {
            Ok(hit) => hit,
            Err(err) => {
                tracing::warn!(error = %err, "failed to transform raw breakpoint hit");
                return;
            }
        };
        self.record_hit(&hit.breakpoint_id, Utc::now().timestamp_millis());
        self.broadcast(LiveInstrumentEvent::new(
            LiveInstrumentEventType::BreakpointHit,
            &hit,
        ));
        tracing::trace!(id = %hit.breakpoint_id, "published live breakpoint hit");
    }

    fn handle_log_hit(&self, body: &Value) {
        let hit: LogHit = match serde_json::from_value(body.clone()) {
            Ok(hit) => hit,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable log hit");
                return;
            }
        };
        self.record_hit(&hit.log_id, Utc::now().timestamp_millis());
        self.broadcast(LiveInstrumentEvent::new(
            LiveInstrumentEventType::LogHit,
            &hit,
        ));
        tracing::trace!(id = %hit.log_id, "published live log hit");
    }

    /// Atomically bump the hit counter for `instrument_id`.
    fn record_hit(&self, instrument_id: &str, now_millis: i64) -> bool {
        let mut instruments = self.instruments.write();
        let existing = instruments
            .iter()
            .find(|dev| dev.instrument.id.as_deref() == Some(instrument_id))
            .cloned();
        match existing {
            Some(dev) => {
                instruments.remove(&dev);
                let mut updated = dev;
                updated.instrument.record_hit(now_millis);
                instruments.insert(updated);
                true
            }
            None => false,
        }
    }

    // --- Removal core ---

    /// Delete the registry entry, notify agents, and resolve or broadcast.
    ///
    /// A waiter on the instrument id is resolved with failure carrying the
    /// removal cause; with nobody waiting, a removed event goes to
    /// subscribers (nil cause means operator-initiated).
    fn remove_internal(
        &self,
        self_id: &str,
        occurred_at: DateTime<Utc>,
        instrument: LiveInstrument,
        cause: Option<&str>,
    ) -> InstrumentResult<()> {
        let kind = instrument.kind();
        tracing::debug!(%kind, id = ?instrument.id, "removing live instrument");

        let dev_instrument = DeveloperInstrument::new(self_id, instrument.clone());
        self.instruments.write().remove(&dev_instrument);

        let command = InstrumentCommand::for_instrument(
            CommandType::RemoveLiveInstrument,
            instrument.clone(),
        );
        let _ = self.dispatcher.publish(kind, &command)?;

        let Some(id) = instrument.id.clone() else {
            return Ok(());
        };

        let parsed_cause = cause.and_then(StackTrace::try_parse);
        let failure = match cause {
            Some(raw) => {
                let err = InstrumentError::from_removal_cause(raw);
                if matches!(err, InstrumentError::UnrecognizedCause(_)) {
                    tracing::error!(%id, cause = raw, "unrecognized removal cause format");
                }
                err
            }
            None => InstrumentError::RemovedBeforeApply(id.clone()),
        };

        let resolved = self.waiting_apply.resolve(&id, Err(failure));
        if !resolved {
            let event = match kind {
                InstrumentKind::Breakpoint => LiveInstrumentEvent::new(
                    LiveInstrumentEventType::BreakpointRemoved,
                    &BreakpointRemoved {
                        breakpoint_id: id.clone(),
                        occurred_at,
                        cause: parsed_cause.clone(),
                    },
                ),
                InstrumentKind::Log => LiveInstrumentEvent::new(
                    LiveInstrumentEventType::LogRemoved,
                    &LogRemoved {
                        log_id: id.clone(),
                        occurred_at,
                        cause: parsed_cause.clone(),
                        live_log: instrument.clone(),
                    },
                ),
            };
            self.broadcast(event);
        }

        match parsed_cause {
            Some(trace) => {
                tracing::warn!(%id, cause = %trace.exception_type, "published live instrument removed")
            }
            None => tracing::info!(%id, "published live instrument removed"),
        }
        Ok(())
    }

    fn broadcast(&self, event: LiveInstrumentEvent) {
        match self.bus.publish(LIVE_INSTRUMENT_SUBSCRIBER, json!(event)) {
            Ok(PublishOutcome::Delivered(_)) | Ok(PublishOutcome::NoSubscriber) => {}
            Err(err) => tracing::warn!(error = %err, "failed to broadcast instrument event"),
        }
    }
}

/// Parse the instrument id out of an agent removal payload: either a
/// command envelope (batch context, first instrument) or a single
/// instrument JSON under the kind key.
fn removed_instrument_id(kind: InstrumentKind, body: &Value) -> Option<String> {
    if let Some(raw_command) = body.get("command").and_then(Value::as_str) {
        let command: InstrumentCommand = serde_json::from_str(raw_command).ok()?;
        return command
            .context
            .live_instruments
            .first()
            .and_then(|instrument| instrument.id.clone());
    }

    let key = match kind {
        InstrumentKind::Breakpoint => "breakpoint",
        InstrumentKind::Log => "log",
    };
    let raw = body.get(key).and_then(Value::as_str)?;
    let instrument: LiveInstrument = serde_json::from_str(raw).ok()?;
    instrument.id
}

fn added_event_type(kind: InstrumentKind) -> LiveInstrumentEventType {
    match kind {
        InstrumentKind::Breakpoint => LiveInstrumentEventType::BreakpointAdded,
        InstrumentKind::Log => LiveInstrumentEventType::LogAdded,
    }
}

fn removed_event_type(kind: InstrumentKind) -> LiveInstrumentEventType {
    match kind {
        InstrumentKind::Breakpoint => LiveInstrumentEventType::BreakpointRemoved,
        InstrumentKind::Log => LiveInstrumentEventType::LogRemoved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::model::SourceLocation;

    fn breakpoint_at(line: i32) -> LiveInstrument {
        LiveInstrument::breakpoint(SourceLocation::new("com.example.Foo", line))
    }

    #[test]
    fn add_without_remote_stays_pending() {
        let bus = EventBus::new();
        let registry = LiveInstrumentRegistry::start(bus);
        let added = registry
            .add_live_instrument("alice", breakpoint_at(1), true)
            .unwrap();
        assert!(added.pending);
        assert!(!added.applied);
        assert!(added.id.is_some());
        assert_eq!(registry.instrument_count(), 1);
    }

    #[test]
    fn apply_immediately_without_remote_rolls_back() {
        let bus = EventBus::new();
        let registry = LiveInstrumentRegistry::start(bus);
        let mut bp = breakpoint_at(1);
        bp.apply_immediately = true;
        let err = registry
            .add_live_instrument("alice", bp, true)
            .unwrap_err();
        assert!(matches!(err, InstrumentError::MissingRemote { .. }));
        assert_eq!(registry.instrument_count(), 0);
    }

    #[test]
    fn hit_recording_updates_meta_in_place() {
        let bus = EventBus::new();
        let registry = LiveInstrumentRegistry::start(bus);
        let added = registry
            .add_live_instrument("alice", breakpoint_at(1), false)
            .unwrap();
        let id = added.id.clone().unwrap();

        assert!(registry.record_hit(&id, 10));
        assert!(registry.record_hit(&id, 20));
        let current = registry.get_live_instrument_by_id(&id).unwrap();
        assert_eq!(current.hit_count(), 2);
        assert!(!registry.record_hit("unknown", 30));
    }

    #[test]
    fn sweep_only_removes_expired_pending() {
        let bus = EventBus::new();
        let registry = LiveInstrumentRegistry::start(bus);

        let mut expired = breakpoint_at(1);
        expired.expires_at = Some(1_000);
        let mut fresh = breakpoint_at(2);
        fresh.expires_at = Some(5_000);
        registry
            .add_live_instrument("alice", expired, false)
            .unwrap();
        registry.add_live_instrument("alice", fresh, false).unwrap();

        let removed = registry.sweep_expired(2_000);
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.instrument_count(), 1);
    }
}
