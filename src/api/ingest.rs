/// Telemetry ingest endpoints
///
/// Receives ChirpStack-shaped uplink webhooks, authenticates them, records
/// the raw device event, marks the device online, and fans the event out to
/// every flow whose trigger nodes match the device or its labels. Node and
/// integration failures inside a flow never fail the ingest request; partial
/// success is a reportable outcome, not an HTTP error.

use crate::api::AppState;
use crate::engine::flows_for_event;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{post, Router},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// How many recent uplinks are checked for a duplicate deduplication id
const DEDUP_WINDOW: i64 = 10;

/// Default online TTL when a device has no expected transmit interval
const DEFAULT_ONLINE_TTL_MINUTES: i64 = 5;

/// ChirpStack uplink event payload
///
/// Every field is optional; join events in particular arrive with most of
/// them absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkEvent {
    #[serde(default, rename = "deduplicationId")]
    pub deduplication_id: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default, rename = "deviceInfo")]
    pub device_info: Option<Value>,
    #[serde(default, rename = "devAddr")]
    pub dev_addr: Option<String>,
    #[serde(default)]
    pub adr: Option<bool>,
    #[serde(default)]
    pub dr: Option<i64>,
    #[serde(default, rename = "fCnt")]
    pub f_cnt: Option<i64>,
    #[serde(default, rename = "fPort")]
    pub f_port: Option<i64>,
    #[serde(default)]
    pub confirmed: Option<bool>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, rename = "rxInfo")]
    pub rx_info: Option<Value>,
    #[serde(default, rename = "txInfo")]
    pub tx_info: Option<Value>,
    #[serde(default)]
    pub phy_payload: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub object: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct IngestQuery {
    /// Optional event type from the provider (e.g. "up", "join")
    pub event: Option<String>,
}

/// Create the ingest routes
pub fn create_ingest_routes() -> Router<AppState> {
    Router::new().route("/api/v1/ingest/chirpstack", post(receive_chirpstack_uplink))
}

/// Receive uplink data from ChirpStack and process it
///
/// POST /api/v1/ingest/chirpstack?event=up
/// Requires a valid API key in the X-API-Key header.
async fn receive_chirpstack_uplink(
    State(state): State<AppState>,
    Query(query): Query<IngestQuery>,
    headers: HeaderMap,
    Json(uplink): Json<UplinkEvent>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if state.api_key.is_empty() || api_key != state.api_key {
        tracing::warn!("🔒 Ingest request rejected: invalid API key");
        return Err(StatusCode::UNAUTHORIZED);
    }

    // Extract and normalize the device EUI
    let dev_eui = uplink
        .device_info
        .as_ref()
        .and_then(|info| info.get("devEui"))
        .and_then(|eui| eui.as_str())
        .map(|eui| eui.to_uppercase());

    let Some(dev_eui) = dev_eui else {
        tracing::error!("❌ No devEui found in ChirpStack data");
        return Ok(accepted(json!({
            "success": false,
            "error": "No devEui found in payload",
            "received_at": Utc::now().to_rfc3339(),
        })));
    };

    tracing::info!("📥 ChirpStack uplink received for device EUI {}", dev_eui);

    let device = match state.store.get_device_by_eui(&dev_eui).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            tracing::warn!("❌ Device with devEui {} not found", dev_eui);
            return Ok(accepted(json!({
                "success": false,
                "error": format!("Device with devEui {} not found", dev_eui),
                "received_at": Utc::now().to_rfc3339(),
            })));
        }
        Err(e) => {
            tracing::error!("❌ Device lookup failed for {}: {}", dev_eui, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    // Event classification: explicit query parameter first, then payload
    // analysis (a frame with neither fCnt nor data is a join)
    let event_type = match query.event.as_deref().map(|e| e.to_lowercase()) {
        Some(ref e) if e == "join" => "join",
        Some(ref e) if e == "up" || e == "uplink" => "uplink",
        _ => {
            if uplink.f_cnt.is_none() && uplink.data.is_none() {
                "join"
            } else {
                "uplink"
            }
        }
    };
    tracing::debug!("🏷️ Event classified as {}", event_type);

    let event_data = if event_type == "join" {
        json!({
            "deduplicationId": uplink.deduplication_id,
            "time": uplink.time,
            "deviceInfo": uplink.device_info,
            "devAddr": uplink.dev_addr,
        })
    } else {
        full_event_payload(&uplink)
    };

    // Deduplicate against the recent history window
    if let Some(dedup_id) = uplink.deduplication_id.as_deref() {
        let recent = state
            .history
            .recent_device_events(device.id, event_type, DEDUP_WINDOW)
            .await
            .unwrap_or_default();
        let duplicate = recent
            .iter()
            .any(|data| data.get("deduplicationId").and_then(|v| v.as_str()) == Some(dedup_id));
        if duplicate {
            tracing::info!("⏭️ Duplicate uplink {} for device {}, skipping", dedup_id, device.id);
            return Ok(accepted(json!({
                "success": false,
                "error": "Deduplication ID already exists in history",
                "received_at": Utc::now().to_rfc3339(),
            })));
        }
    }

    state
        .history
        .record_device_event(device.id, event_type, &event_data)
        .await;

    // Mark the device online with a TTL derived from its transmit cadence
    let ttl_minutes = device
        .expected_transmit_interval
        .unwrap_or(DEFAULT_ONLINE_TTL_MINUTES);
    state
        .presence
        .mark_online(device.id, Duration::from_secs((ttl_minutes * 60) as u64))
        .await;
    if device.status.as_deref() != Some("online") {
        if let Err(e) = state.store.update_device_status(device.id, "online").await {
            tracing::warn!("⚠️ Could not update device {} status: {}", device.id, e);
        }
    }

    // Joins never trigger flow processing
    if event_type == "join" {
        tracing::info!("🤝 Join event for device {}, no flow processing", device.id);
        return Ok(accepted(json!({
            "success": true,
            "device_id": device.id,
            "dev_eui": dev_eui,
            "flows_processed": 0,
            "received_at": Utc::now().to_rfc3339(),
        })));
    }

    let payload = full_event_payload(&uplink);

    let label_ids = state
        .store
        .label_ids_for_device(device.id)
        .await
        .unwrap_or_default();

    let all_flows = match state.store.list_flows().await {
        Ok(flows) => flows,
        Err(e) => {
            tracing::error!("❌ Could not load flows: {}", e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let candidates = flows_for_event(&all_flows, device.id, &dev_eui, &label_ids);
    tracing::info!(
        "🔍 {} of {} flows match device {} (labels: {:?})",
        candidates.len(),
        all_flows.len(),
        device.id,
        label_ids
    );

    let mut flows_processed = 0usize;
    for flow in candidates {
        let summary = state
            .engine
            .run_flow(flow, device.id, &dev_eui, &payload, &label_ids)
            .await;
        tracing::info!(
            "📊 Flow {} finished with status {:?} in {}ms",
            summary.flow_id,
            summary.status,
            summary.execution_time_ms
        );
        flows_processed += 1;
    }

    tracing::info!(
        "✅ Processed uplink for device {} through {} flows",
        dev_eui,
        flows_processed
    );

    Ok(accepted(json!({
        "success": true,
        "device_id": device.id,
        "dev_eui": dev_eui,
        "flows_processed": flows_processed,
        "received_at": Utc::now().to_rfc3339(),
    })))
}

fn accepted(body: Value) -> (StatusCode, Json<Value>) {
    (StatusCode::ACCEPTED, Json(body))
}

/// Full uplink payload handed to flow processing and the device history
fn full_event_payload(uplink: &UplinkEvent) -> Value {
    json!({
        "deduplicationId": uplink.deduplication_id,
        "time": uplink.time,
        "deviceInfo": uplink.device_info,
        "devAddr": uplink.dev_addr,
        "adr": uplink.adr,
        "dr": uplink.dr,
        "fCnt": uplink.f_cnt,
        "fPort": uplink.f_port,
        "confirmed": uplink.confirmed,
        "data": uplink.data,
        "rxInfo": uplink.rx_info,
        "txInfo": uplink.tx_info,
        "phy_payload": uplink.phy_payload,
        "metadata": uplink.metadata,
        "object": uplink.object,
    })
}
