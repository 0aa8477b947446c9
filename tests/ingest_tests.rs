/// Ingest boundary scenarios
///
/// Runs the real axum app against an ephemeral port and drives it over HTTP:
/// authentication, device lookup, event classification, deduplication, and
/// flow fan-out.

use fieldflow::api::{ingest::create_ingest_routes, AppState};
use fieldflow::engine::FlowEngine;
use fieldflow::flow::presence::DevicePresence;
use fieldflow::flow::store::EntityStore;
use fieldflow::flow::types::{Edge, FlowNode, NodeKind};
use fieldflow::history::store::HistoryStore;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const TEST_API_KEY: &str = "test-ingest-key";

struct TestApp {
    addr: SocketAddr,
    store: Arc<EntityStore>,
    history: Arc<HistoryStore>,
}

async fn spawn_app() -> TestApp {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    let store = Arc::new(EntityStore::new(pool.clone()));
    store.init_schema().await.unwrap();
    let history = Arc::new(HistoryStore::new(pool));
    history.init_schema().await.unwrap();

    let engine = Arc::new(FlowEngine::new(
        Arc::clone(&store),
        Arc::clone(&history),
        Duration::from_secs(5),
        Duration::from_secs(5),
        Duration::from_secs(1),
    ));

    let state = AppState {
        store: Arc::clone(&store),
        history: Arc::clone(&history),
        engine,
        presence: Arc::new(DevicePresence::new()),
        api_key: TEST_API_KEY.to_string(),
    };

    let app = create_ingest_routes().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        addr,
        store,
        history,
    }
}

fn uplink_body(dev_eui: &str, dedup_id: &str) -> Value {
    json!({
        "deduplicationId": dedup_id,
        "time": "2026-08-08T10:00:00Z",
        "deviceInfo": {"devEui": dev_eui, "deviceName": "soil-probe-7"},
        "fCnt": 12,
        "fPort": 2,
        "data": "AQI=",
        "object": {"x": 1}
    })
}

async fn post_uplink(app: &TestApp, key: Option<&str>, query: &str, body: &Value) -> reqwest::Response {
    let client = reqwest::Client::new();
    let mut request = client
        .post(format!("http://{}/api/v1/ingest/chirpstack{}", app.addr, query))
        .json(body);
    if let Some(key) = key {
        request = request.header("X-API-Key", key);
    }
    request.send().await.unwrap()
}

#[tokio::test]
async fn rejects_missing_or_invalid_api_key() {
    let app = spawn_app().await;
    let body = uplink_body("A1B2C3D4E5F60708", "dd-1");

    let response = post_uplink(&app, None, "", &body).await;
    assert_eq!(response.status(), 401);

    let response = post_uplink(&app, Some("wrong"), "", &body).await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn unknown_device_is_acknowledged_but_not_processed() {
    let app = spawn_app().await;
    let body = uplink_body("FFFFFFFFFFFFFFFF", "dd-1");

    let response = post_uplink(&app, Some(TEST_API_KEY), "", &body).await;
    assert_eq!(response.status(), 202);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn uplink_runs_matching_flows_and_marks_device_online() {
    let app = spawn_app().await;

    let device_id = app
        .store
        .save_device("soil-7", "A1B2C3D4E5F60708", Some(10))
        .await
        .unwrap();
    let function_id = app
        .store
        .save_function(
            "decode",
            "function decodeUplink(input) return { x = input.object.x + 1 } end",
        )
        .await
        .unwrap();
    let nodes = vec![
        FlowNode {
            id: "d1".to_string(),
            kind: NodeKind::Device,
            data: json!({"deviceId": device_id}).as_object().unwrap().clone(),
        },
        FlowNode {
            id: "f1".to_string(),
            kind: NodeKind::Function,
            data: json!({"functionId": function_id}).as_object().unwrap().clone(),
        },
    ];
    let edges = vec![Edge {
        source: "d1".to_string(),
        target: "f1".to_string(),
    }];
    app.store.save_flow("decode flow", &nodes, &edges).await.unwrap();

    let body = uplink_body("a1b2c3d4e5f60708", "dd-1");
    let response = post_uplink(&app, Some(TEST_API_KEY), "?event=up", &body).await;
    assert_eq!(response.status(), 202);

    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["success"], true);
    assert_eq!(reply["device_id"], device_id);
    assert_eq!(reply["dev_eui"], "A1B2C3D4E5F60708");
    assert_eq!(reply["flows_processed"], 1);

    // The transform ran against the uplink payload
    let runs = app.history.function_runs(function_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "success");
    assert_eq!(runs[0].output_data, Some(json!({"x": 2})));

    // Device flipped online
    let device = app
        .store
        .get_device_by_eui("A1B2C3D4E5F60708")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.status.as_deref(), Some("online"));
}

#[tokio::test]
async fn duplicate_deduplication_id_is_skipped() {
    let app = spawn_app().await;
    app.store
        .save_device("soil-7", "A1B2C3D4E5F60708", None)
        .await
        .unwrap();

    let body = uplink_body("A1B2C3D4E5F60708", "dd-same");
    let first = post_uplink(&app, Some(TEST_API_KEY), "", &body).await;
    let first: Value = first.json().await.unwrap();
    assert_eq!(first["success"], true);

    let second = post_uplink(&app, Some(TEST_API_KEY), "", &body).await;
    let second: Value = second.json().await.unwrap();
    assert_eq!(second["success"], false);
    assert!(second["error"]
        .as_str()
        .unwrap()
        .contains("Deduplication ID already exists"));
}

#[tokio::test]
async fn join_events_skip_flow_processing() {
    let app = spawn_app().await;
    let device_id = app
        .store
        .save_device("soil-7", "A1B2C3D4E5F60708", None)
        .await
        .unwrap();

    // No fCnt and no data: classified as a join even without the query hint
    let body = json!({
        "deduplicationId": "dd-join",
        "deviceInfo": {"devEui": "A1B2C3D4E5F60708"},
        "devAddr": "01020304"
    });
    let response = post_uplink(&app, Some(TEST_API_KEY), "", &body).await;
    assert_eq!(response.status(), 202);

    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["success"], true);
    assert_eq!(reply["flows_processed"], 0);

    let joins = app.history.recent_device_events(device_id, "join", 10).await.unwrap();
    assert_eq!(joins.len(), 1);
}

#[tokio::test]
async fn missing_dev_eui_is_reported() {
    let app = spawn_app().await;
    let body = json!({"deduplicationId": "dd-1", "fCnt": 1, "data": "AQ=="});

    let response = post_uplink(&app, Some(TEST_API_KEY), "", &body).await;
    assert_eq!(response.status(), 202);

    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().contains("No devEui"));
}
