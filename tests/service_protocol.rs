use serde_json::{Value, json};
use spotlight::bus::EventBus;
use spotlight::instrument::command::{LIVE_BREAKPOINT_APPLIED, LIVE_BREAKPOINT_REMOTE};
use spotlight::platform::{Platform, PlatformConfig};
use spotlight::service::Service;
use std::io::Cursor;
use std::sync::Arc;

fn run_session(platform: Arc<Platform>, requests: Vec<Value>) -> Vec<Value> {
    let input = requests
        .into_iter()
        .map(|req| serde_json::to_string(&req).unwrap())
        .collect::<Vec<_>>()
        .join("\n");

    let mut output = Vec::<u8>::new();
    let mut service = Service::new(platform);
    service
        .handle(Cursor::new(format!("{input}\n")), &mut output)
        .unwrap();

    output
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice::<Value>(line).unwrap())
        .collect()
}

fn handshake(id: u64) -> Value {
    json!({"id": id, "command": "handshake", "params": {
        "client": "test",
        "protocol_version": spotlight::PROTOCOL_VERSION,
        "developer": "alice",
    }})
}

fn test_platform() -> (Arc<Platform>, EventBus) {
    let bus = EventBus::new();
    let config = PlatformConfig {
        background_sweep: false,
        ..PlatformConfig::default()
    };
    let platform = Platform::start_on(config, bus.clone()).unwrap();
    (Arc::new(platform), bus)
}

#[test]
fn service_handles_instrument_crud() {
    let (platform, _bus) = test_platform();

    let requests = vec![
        json!({"id": 1, "command": "status", "params": {}}),
        handshake(2),
        json!({"id": 3, "command": "add_instrument", "params": {
            "instrument": {
                "type": "BREAKPOINT",
                "location": {"source": "com.example.OrderService", "line": 10},
            },
        }}),
        json!({"id": 4, "command": "get_instruments", "params": {}}),
        json!({"id": 5, "command": "get_instrument", "params": {"id": "nope"}}),
        json!({"id": 6, "command": "noop", "params": {}}),
    ];
    let responses = run_session(platform.clone(), requests);
    assert_eq!(responses.len(), 6);

    // Commands before the handshake are rejected.
    assert_eq!(responses[0]["error"]["code"], "protocol_error");
    assert!(responses[1]["result"]["platform"]["version"].is_string());

    let added = &responses[2]["result"];
    assert_eq!(added["pending"], true);
    assert_eq!(added["applied"], false);
    let id = added["id"].as_str().unwrap().to_string();

    assert_eq!(responses[3]["result"].as_array().unwrap().len(), 1);
    assert_eq!(responses[4]["error"]["code"], "invalid_instrument_id");
    assert_eq!(responses[5]["error"]["code"], "unsupported_command");

    // Batch lookup skips unknown ids.
    let responses = run_session(
        platform.clone(),
        vec![
            handshake(1),
            json!({"id": 2, "command": "get_instruments_by_ids", "params": {
                "ids": [id, "nope"],
            }}),
        ],
    );
    assert_eq!(responses[1]["result"].as_array().unwrap().len(), 1);

    // Remove through a second session.
    let responses = run_session(
        platform,
        vec![
            handshake(1),
            json!({"id": 2, "command": "remove_instrument", "params": {"id": id}}),
            json!({"id": 3, "command": "remove_instrument", "params": {"id": id}}),
        ],
    );
    assert!(responses[1]["result"]["id"].is_string());
    assert_eq!(responses[2]["error"]["code"], "invalid_instrument_id");
}

#[test]
fn apply_immediately_fails_fast_without_agent() {
    let (platform, _bus) = test_platform();
    let responses = run_session(
        platform,
        vec![
            handshake(1),
            json!({"id": 2, "command": "add_instrument", "params": {
                "instrument": {
                    "type": "BREAKPOINT",
                    "location": {"source": "com.example.OrderService", "line": 10},
                    "applyImmediately": true,
                },
            }}),
        ],
    );
    assert_eq!(responses[1]["error"]["code"], "missing_remote");
    assert_eq!(
        responses[1]["error"]["details"]["address"],
        LIVE_BREAKPOINT_REMOTE
    );
}

#[test]
fn apply_immediately_returns_applied_instrument_with_agent() {
    let (platform, bus) = test_platform();

    // Simulated probe confirming every ADD inline.
    let bus_clone = bus.clone();
    let _agent = bus.consumer(LIVE_BREAKPOINT_REMOTE, move |command: &Value| {
        if command["commandType"] == "ADD_LIVE_INSTRUMENT" {
            let instrument = command["context"]["liveInstruments"][0].clone();
            bus_clone
                .publish(LIVE_BREAKPOINT_APPLIED, instrument)
                .unwrap();
        }
    });

    let responses = run_session(
        platform,
        vec![
            handshake(1),
            json!({"id": 2, "command": "add_instrument", "params": {
                "instrument": {
                    "type": "BREAKPOINT",
                    "location": {"source": "com.example.OrderService", "line": 10},
                    "applyImmediately": true,
                },
                "timeout_ms": 1_000,
            }}),
        ],
    );
    let applied = &responses[1]["result"];
    assert_eq!(applied["applied"], true);
    assert_eq!(applied["pending"], false);
}

#[test]
fn service_handles_view_subscription_crud() {
    let (platform, _bus) = test_platform();
    let subscription = json!({
        "entityIds": ["e1"],
        "artifactQualifiedName": "com.example.OrderService.submit",
        "viewConfig": {"viewName": "chart", "viewMetrics": ["endpoint_cpm"]},
    });

    let responses = run_session(
        platform,
        vec![
            handshake(1),
            json!({"id": 2, "command": "add_live_view", "params": {"subscription": subscription}}),
            json!({"id": 3, "command": "get_live_views", "params": {}}),
            json!({"id": 4, "command": "view_stats", "params": {}}),
            json!({"id": 5, "command": "get_live_view", "params": {"id": "view.missing"}}),
            json!({"id": 6, "command": "clear_live_views", "params": {}}),
            json!({"id": 7, "command": "get_live_views", "params": {}}),
        ],
    );

    let added = &responses[1]["result"];
    let id = added["subscriptionId"].as_str().unwrap();
    assert!(id.starts_with("view."));

    let listed = responses[2]["result"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["subscriptionId"], id);

    assert_eq!(responses[3]["result"]["endpoint_cpm"]["e1"], 1);
    assert_eq!(responses[4]["error"]["code"], "invalid_subscription_id");
    assert_eq!(responses[5]["result"].as_array().unwrap().len(), 1);
    assert_eq!(responses[6]["result"].as_array().unwrap().len(), 0);
}

#[test]
fn update_live_view_moves_entities_through_the_service() {
    let (platform, _bus) = test_platform();
    let responses = run_session(
        platform.clone(),
        vec![
            handshake(1),
            json!({"id": 2, "command": "add_live_view", "params": {"subscription": {
                "entityIds": ["e1"],
                "artifactQualifiedName": "com.example.OrderService.submit",
                "viewConfig": {"viewName": "chart", "viewMetrics": ["m"]},
            }}}),
        ],
    );
    let id = responses[1]["result"]["subscriptionId"]
        .as_str()
        .unwrap()
        .to_string();

    let responses = run_session(
        platform,
        vec![
            handshake(1),
            json!({"id": 2, "command": "update_live_view", "params": {
                "id": id,
                "subscription": {
                    "entityIds": ["e2"],
                    "artifactQualifiedName": "com.example.OrderService.submit",
                    "viewConfig": {"viewName": "chart", "viewMetrics": ["m"]},
                },
            }}),
            json!({"id": 3, "command": "view_stats", "params": {}}),
        ],
    );
    assert_eq!(
        responses[1]["result"]["entityIds"],
        json!(["e2"])
    );
    assert_eq!(responses[2]["result"]["m"]["e2"], 1);
    assert!(responses[2]["result"]["m"].get("e1").is_none());
}
