use parking_lot::Mutex;
use serde_json::{Value, json};
use spotlight::bus::EventBus;
use spotlight::error::InstrumentError;
use spotlight::instrument::command::{
    BREAKPOINT_HIT, LIVE_BREAKPOINT_APPLIED, LIVE_BREAKPOINT_REMOTE, LIVE_BREAKPOINT_REMOVED,
    LIVE_INSTRUMENT_SUBSCRIBER, PROBE_CONNECTED,
};
use spotlight::instrument::model::{
    DeveloperInstrument, InstrumentKind, LiveInstrument, SourceLocation,
};
use spotlight::platform::{Platform, PlatformConfig};
use std::sync::Arc;

fn test_platform() -> (Platform, EventBus) {
    let bus = EventBus::new();
    let config = PlatformConfig {
        background_sweep: false,
        ..PlatformConfig::default()
    };
    let platform = Platform::start_on(config, bus.clone()).unwrap();
    (platform, bus)
}

fn breakpoint_at(line: i32) -> LiveInstrument {
    LiveInstrument::breakpoint(SourceLocation::new("com.example.OrderService", line))
}

/// Simulated probe: confirms every ADD command by echoing the instrument
/// back on the applied address, marked applied.
fn attach_confirming_agent(bus: &EventBus) {
    let bus_clone = bus.clone();
    // The handle is dropped; consumers stay registered until explicitly
    // unregistered or the bus closes.
    let _ = bus.consumer(LIVE_BREAKPOINT_REMOTE, move |command: &Value| {
        if command["commandType"] == "ADD_LIVE_INSTRUMENT" {
            let instrument = command["context"]["liveInstruments"][0].clone();
            bus_clone
                .publish(LIVE_BREAKPOINT_APPLIED, instrument)
                .unwrap();
        }
    });
}

#[test]
fn add_without_agent_leaves_instrument_pending() {
    let (platform, _bus) = test_platform();
    let added = platform
        .instruments()
        .add_live_instrument("alice", breakpoint_at(10), true)
        .unwrap();

    assert!(added.pending);
    assert!(!added.applied);
    let stored = platform
        .instruments()
        .get_live_instrument_by_id(added.id.as_deref().unwrap())
        .unwrap();
    assert!(stored.pending);
}

#[test]
fn apply_immediately_without_agent_fails_with_missing_remote() {
    let (platform, _bus) = test_platform();
    let mut bp = breakpoint_at(10);
    bp.apply_immediately = true;

    let err = platform
        .instruments()
        .add_live_instrument("alice", bp, true)
        .unwrap_err();
    assert!(matches!(err, InstrumentError::MissingRemote { .. }));
    assert!(platform.instruments().get_live_instruments().is_empty());
}

#[test]
fn applied_confirmation_transitions_state_and_resolves_waiter_once() {
    let (platform, bus) = test_platform();
    let registry = platform.instruments();

    let added = registry
        .add_live_instrument("alice", breakpoint_at(10), false)
        .unwrap();
    let id = added.id.clone().unwrap();

    let resolutions: Arc<Mutex<Vec<Result<DeveloperInstrument, InstrumentError>>>> =
        Arc::new(Mutex::new(Vec::new()));
    let resolutions_clone = resolutions.clone();
    registry.add_apply_immediately_handler(
        id.clone(),
        Box::new(move |result| {
            resolutions_clone.lock().push(result);
        }),
    );

    // Agent confirms after the fact.
    bus.publish(LIVE_BREAKPOINT_APPLIED, json!(added)).unwrap();

    let stored = registry.get_live_instrument_by_id(&id).unwrap();
    assert!(stored.applied);
    assert!(!stored.pending);
    assert_eq!(registry.get_active_live_breakpoints().len(), 1);

    // A duplicate confirmation must not fire the handler again.
    bus.publish(LIVE_BREAKPOINT_APPLIED, json!(added)).unwrap();
    let resolutions = resolutions.lock();
    assert_eq!(resolutions.len(), 1);
    let confirmed = resolutions[0].as_ref().unwrap();
    assert!(confirmed.instrument.applied);
    assert_eq!(confirmed.self_id, "alice");
}

#[test]
fn remove_before_confirmation_fails_the_waiter_exactly_once() {
    let (platform, _bus) = test_platform();
    let registry = platform.instruments();

    let added = registry
        .add_live_instrument("alice", breakpoint_at(10), false)
        .unwrap();
    let id = added.id.clone().unwrap();

    let resolutions: Arc<Mutex<Vec<Result<DeveloperInstrument, InstrumentError>>>> =
        Arc::new(Mutex::new(Vec::new()));
    let resolutions_clone = resolutions.clone();
    registry.add_apply_immediately_handler(
        id.clone(),
        Box::new(move |result| {
            resolutions_clone.lock().push(result);
        }),
    );

    let removed = registry.remove_live_instrument("alice", &id).unwrap();
    assert!(removed.is_some());
    assert!(registry.get_live_instruments().is_empty());

    let resolutions = resolutions.lock();
    assert_eq!(resolutions.len(), 1);
    assert!(matches!(
        resolutions[0],
        Err(InstrumentError::RemovedBeforeApply(_))
    ));
}

#[test]
fn hits_accumulate_with_first_hit_set_once() {
    let (platform, bus) = test_platform();
    let registry = platform.instruments();
    let added = registry
        .add_live_instrument("alice", breakpoint_at(10), false)
        .unwrap();
    let id = added.id.clone().unwrap();

    let payload = json!({
        "breakpoint_id": id,
        "trace_id": "trace-1",
        "occurred_at": 1_650_000_000_000i64,
        "service": "order-service",
        "service_host": "host-1",
        "location_source": "com.example.OrderService",
        "location_line": 10,
        "variables": [],
        "stack_trace": "java.lang.Exception: capture\n\tat com.example.OrderService.submit(OrderService.java:10)\n\tat com.example.Dispatcher.run(Dispatcher.java:3)",
    });

    for _ in 0..3 {
        bus.publish(BREAKPOINT_HIT, payload.clone()).unwrap();
    }

    let stored = registry.get_live_instrument_by_id(&id).unwrap();
    assert_eq!(stored.hit_count(), 3);
    let first = stored.meta.get("first_hit").unwrap().clone();
    let last = stored.meta.get("last_hit").unwrap().clone();

    bus.publish(BREAKPOINT_HIT, payload).unwrap();
    let stored = registry.get_live_instrument_by_id(&id).unwrap();
    assert_eq!(stored.hit_count(), 4);
    assert_eq!(stored.meta.get("first_hit").unwrap(), &first);
    assert!(stored.meta.get("last_hit").unwrap() >= &last);
}

#[test]
fn breakpoint_hits_reach_subscribers_with_skip_markers_intact() {
    let (platform, bus) = test_platform();
    let registry = platform.instruments();
    let added = registry
        .add_live_instrument("alice", breakpoint_at(10), false)
        .unwrap();
    let id = added.id.clone().unwrap();

    let (_handle, events) = bus.channel_consumer(LIVE_INSTRUMENT_SUBSCRIBER, 16);

    let two_mb = (2 * 1024 * 1024) + 16;
    let payload = json!({
        "breakpoint_id": id,
        "trace_id": "trace-1",
        "occurred_at": 1_650_000_000_000i64,
        "service": "order-service",
        "service_host": "host-1",
        "location_source": "com.example.OrderService",
        "location_line": 10,
        "variables": [{
            "scope": "LOCAL_VARIABLE",
            "data": {
                "twoMbArr": serde_json::to_string(&json!({
                    "twoMbArr": {"@skip": "MAX_SIZE_EXCEEDED", "@class": "[B", "@size": two_mb},
                })).unwrap(),
            },
        }],
        "stack_trace": "java.lang.Exception: capture\n\tat com.example.OrderService.submit(OrderService.java:10)\n\tat com.example.Dispatcher.run(Dispatcher.java:3)",
    });
    bus.publish(BREAKPOINT_HIT, payload).unwrap();

    let event = events.try_recv().unwrap();
    assert_eq!(event["eventType"], "BREAKPOINT_HIT");
    let hit: Value = serde_json::from_str(event["data"].as_str().unwrap()).unwrap();
    let variable = &hit["stackTrace"]["frames"][0]["variables"][0];
    assert_eq!(variable["name"], "twoMbArr");
    assert_eq!(variable["value"]["@skip"], "MAX_SIZE_EXCEEDED");
    assert_eq!(variable["value"]["@class"], "[B");
    assert_eq!(variable["value"]["@size"], two_mb);
}

#[test]
fn expired_pending_instruments_are_swept() {
    let (platform, _bus) = test_platform();
    let registry = platform.instruments();

    let mut bp = breakpoint_at(10);
    bp.expires_at = Some(1_000);
    registry.add_live_instrument("alice", bp, false).unwrap();

    // TTL not yet elapsed: nothing happens.
    assert!(registry.sweep_expired(999).is_empty());
    // Next tick past the deadline removes it without an explicit call.
    assert_eq!(registry.sweep_expired(1_000).len(), 1);
    assert!(registry.get_live_instruments().is_empty());
}

#[test]
fn probe_reconnect_republishes_pending_instruments() {
    let (platform, bus) = test_platform();
    let registry = platform.instruments();

    registry
        .add_live_instrument("alice", breakpoint_at(10), false)
        .unwrap();
    registry
        .add_live_instrument("alice", breakpoint_at(11), false)
        .unwrap();

    // An agent connects late and signals registration.
    let commands: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let commands_clone = commands.clone();
    let _agent = bus.consumer(LIVE_BREAKPOINT_REMOTE, move |command: &Value| {
        commands_clone.lock().push(command.clone());
    });
    bus.publish(PROBE_CONNECTED, json!({"address": LIVE_BREAKPOINT_REMOTE}))
        .unwrap();

    let commands = commands.lock();
    assert_eq!(commands.len(), 2);
    assert!(commands
        .iter()
        .all(|command| command["commandType"] == "ADD_LIVE_INSTRUMENT"));
}

#[test]
fn applied_instruments_are_not_resent_on_reconnect() {
    let (platform, bus) = test_platform();
    let registry = platform.instruments();
    attach_confirming_agent(&bus);

    registry
        .add_live_instrument("alice", breakpoint_at(10), false)
        .unwrap();
    assert_eq!(registry.get_active_live_breakpoints().len(), 1);

    let commands: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let commands_clone = commands.clone();
    let _watcher = bus.consumer(LIVE_BREAKPOINT_REMOTE, move |command: &Value| {
        commands_clone.lock().push(command.clone());
    });
    bus.publish(PROBE_CONNECTED, json!({"address": LIVE_BREAKPOINT_REMOTE}))
        .unwrap();

    assert!(commands.lock().is_empty());
}

#[test]
fn remove_by_location_clears_matching_kind_only() {
    let (platform, bus) = test_platform();
    let registry = platform.instruments();

    let location = SourceLocation::new("com.example.OrderService", 10);
    registry
        .add_live_instrument("alice", LiveInstrument::breakpoint(location.clone()), false)
        .unwrap();
    registry
        .add_live_instrument(
            "alice",
            LiveInstrument::log(location.clone(), "total={}", vec!["total".into()]),
            false,
        )
        .unwrap();

    let (_handle, events) = bus.channel_consumer(LIVE_INSTRUMENT_SUBSCRIBER, 16);
    let removed = registry
        .remove_instruments_at("alice", &location, InstrumentKind::Breakpoint)
        .unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(registry.get_live_instruments().len(), 1);
    assert_eq!(
        registry.get_live_instruments()[0].kind(),
        InstrumentKind::Log
    );

    let event = events.try_recv().unwrap();
    assert_eq!(event["eventType"], "BREAKPOINT_REMOVED");
}

#[test]
fn agent_reported_removal_broadcasts_cause_to_subscribers() {
    let (platform, bus) = test_platform();
    let registry = platform.instruments();

    let added = registry
        .add_live_instrument("alice", breakpoint_at(10), false)
        .unwrap();
    let id = added.id.clone().unwrap();

    let (_handle, events) = bus.channel_consumer(LIVE_INSTRUMENT_SUBSCRIBER, 16);
    bus.publish(
        LIVE_BREAKPOINT_REMOVED,
        json!({
            "breakpoint": serde_json::to_string(&added).unwrap(),
            "occurredAt": 1_650_000_000_000i64,
            "cause": "java.lang.IllegalStateException: boom\n\tat com.example.OrderService.submit(OrderService.java:10)",
        }),
    )
    .unwrap();

    assert!(registry.get_live_instruments().is_empty());
    let event = events.try_recv().unwrap();
    assert_eq!(event["eventType"], "BREAKPOINT_REMOVED");
    let payload: Value = serde_json::from_str(event["data"].as_str().unwrap()).unwrap();
    assert_eq!(payload["breakpointId"], id.as_str());
    assert_eq!(payload["cause"]["exceptionType"], "java.lang.IllegalStateException");
}

#[test]
fn unrecognized_removal_cause_resolves_waiter_with_structured_error() {
    let (platform, bus) = test_platform();
    let registry = platform.instruments();

    let added = registry
        .add_live_instrument("alice", breakpoint_at(10), false)
        .unwrap();
    let id = added.id.clone().unwrap();

    let resolutions: Arc<Mutex<Vec<Result<DeveloperInstrument, InstrumentError>>>> =
        Arc::new(Mutex::new(Vec::new()));
    let resolutions_clone = resolutions.clone();
    registry.add_apply_immediately_handler(
        id.clone(),
        Box::new(move |result| {
            resolutions_clone.lock().push(result);
        }),
    );

    bus.publish(
        LIVE_BREAKPOINT_REMOVED,
        json!({
            "breakpoint": serde_json::to_string(&added).unwrap(),
            "occurredAt": 1_650_000_000_000i64,
            "cause": "something the platform has never seen",
        }),
    )
    .unwrap();

    let resolutions = resolutions.lock();
    assert_eq!(resolutions.len(), 1);
    assert!(matches!(
        resolutions[0],
        Err(InstrumentError::UnrecognizedCause(_))
    ));
}

#[test]
fn recognized_event_bus_cause_resolves_waiter_with_remote_failure() {
    let (platform, bus) = test_platform();
    let registry = platform.instruments();

    let added = registry
        .add_live_instrument("alice", breakpoint_at(10), false)
        .unwrap();
    let id = added.id.clone().unwrap();

    let resolutions: Arc<Mutex<Vec<Result<DeveloperInstrument, InstrumentError>>>> =
        Arc::new(Mutex::new(Vec::new()));
    let resolutions_clone = resolutions.clone();
    registry.add_apply_immediately_handler(
        id.clone(),
        Box::new(move |result| {
            resolutions_clone.lock().push(result);
        }),
    );

    bus.publish(
        LIVE_BREAKPOINT_REMOVED,
        json!({
            "breakpoint": serde_json::to_string(&added).unwrap(),
            "occurredAt": 1_650_000_000_000i64,
            "cause": "EventBusException:LiveInstrumentException[Expression evaluation failed]",
        }),
    )
    .unwrap();

    let resolutions = resolutions.lock();
    assert_eq!(resolutions.len(), 1);
    match &resolutions[0] {
        Err(InstrumentError::RemoteFailure {
            error_type,
            message,
        }) => {
            assert_eq!(error_type, "LiveInstrumentException");
            assert_eq!(message, "Expression evaluation failed");
        }
        other => panic!("expected RemoteFailure, got {other:?}"),
    }
}
