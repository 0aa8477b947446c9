/// Integration node execution over HTTP and MQTT
///
/// Dispatches the current payload to an external endpoint based on the
/// stored integration configuration and normalizes the heterogeneous
/// transport results into one success/error shape. Every execution writes
/// exactly one IntegrationExecutionRecord and updates the owning
/// integration's last-known status, last write wins.

use crate::engine::error::IntegrationError;
use crate::flow::store::EntityStore;
use crate::flow::types::{FlowNode, Integration};
use crate::history::records::NodeRunStatus;
use crate::history::store::{truncate_chars, HistoryStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Characters of a failed HTTP response body kept in the error message
const RESPONSE_SNIPPET_LIMIT: usize = 500;

/// Outcome of one integration-node execution
#[derive(Debug)]
pub struct IntegrationNodeOutcome {
    /// Normalized transport response, or the typed failure
    pub result: Result<Value, IntegrationError>,
    /// History record id, when one could be written
    pub record_id: Option<i64>,
    /// Wall-clock execution time
    pub execution_time_ms: i64,
}

/// Executes integration nodes and records their history
#[derive(Debug, Clone)]
pub struct IntegrationExecutor {
    store: Arc<EntityStore>,
    history: Arc<HistoryStore>,
    http: reqwest::Client,
    /// Bounded wait for an HTTP round trip
    http_timeout: Duration,
    /// Bounded wait per MQTT stage (connect, publish ack)
    mqtt_timeout: Duration,
}

impl IntegrationExecutor {
    pub fn new(
        store: Arc<EntityStore>,
        history: Arc<HistoryStore>,
        http_timeout: Duration,
        mqtt_timeout: Duration,
    ) -> Self {
        Self {
            store,
            history,
            http: reqwest::Client::new(),
            http_timeout,
            mqtt_timeout,
        }
    }

    /// Execute an integration node against the current payload
    ///
    /// A node whose attributes cannot be resolved to a stored integration
    /// produces an error result without a record; every execution of an
    /// existing integration writes exactly one record.
    pub async fn execute_integration_node(
        &self,
        node: &FlowNode,
        payload: &Value,
        flow_id: Option<i64>,
    ) -> IntegrationNodeOutcome {
        tracing::debug!("📡 Executing integration node: {}", node.id);

        let integration_id = match node.entity_id("integrationId") {
            Some(id) => id,
            None => {
                tracing::error!("❌ Integration node {} has no usable integration id", node.id);
                return IntegrationNodeOutcome {
                    result: Err(IntegrationError::MissingIntegrationId),
                    record_id: None,
                    execution_time_ms: 0,
                };
            }
        };

        let integration = match self.store.get_integration(integration_id).await {
            Ok(Some(integration)) => integration,
            Ok(None) => {
                tracing::error!("❌ Integration with ID {} not found", integration_id);
                return IntegrationNodeOutcome {
                    result: Err(IntegrationError::IntegrationNotFound(integration_id)),
                    record_id: None,
                    execution_time_ms: 0,
                };
            }
            Err(e) => {
                tracing::error!("❌ Integration lookup failed for ID {}: {}", integration_id, e);
                return IntegrationNodeOutcome {
                    result: Err(IntegrationError::IntegrationNotFound(integration_id)),
                    record_id: None,
                    execution_time_ms: 0,
                };
            }
        };

        let record_id = self
            .history
            .begin_integration_run(integration_id, flow_id, payload)
            .await;

        let start = Instant::now();
        let result = self.dispatch(&integration, payload).await;
        let execution_time_ms = start.elapsed().as_millis() as i64;

        match &result {
            Ok(response) => {
                tracing::info!(
                    "✅ Integration {} ({}) executed successfully in {}ms",
                    integration.name,
                    integration_id,
                    execution_time_ms
                );
                if let Some(id) = record_id {
                    self.history
                        .finish_integration_run(
                            id,
                            NodeRunStatus::Success,
                            Some(response),
                            None,
                            execution_time_ms,
                        )
                        .await;
                }
            }
            Err(e) => {
                tracing::error!(
                    "❌ Integration {} ({}) failed in {}ms: {}",
                    integration.name,
                    integration_id,
                    execution_time_ms,
                    e
                );
                if let Some(id) = record_id {
                    self.history
                        .finish_integration_run(
                            id,
                            NodeRunStatus::Error,
                            None,
                            Some(&e.to_string()),
                            execution_time_ms,
                        )
                        .await;
                }
            }
        }

        // Last-write-wins status on the owning integration entity
        let entity_status = if result.is_ok() { "success" } else { "error" };
        if let Err(e) = self
            .store
            .update_integration_status(integration_id, entity_status)
            .await
        {
            tracing::warn!("⚠️ Could not update integration {} status: {}", integration_id, e);
        }

        IntegrationNodeOutcome {
            result,
            record_id,
            execution_time_ms,
        }
    }

    async fn dispatch(
        &self,
        integration: &Integration,
        payload: &Value,
    ) -> Result<Value, IntegrationError> {
        match integration.kind.as_str() {
            "http" => self.send_http(&integration.config, payload).await,
            "mqtt" => self.send_mqtt(&integration.config, payload).await,
            other => Err(IntegrationError::ConfigInvalid(format!(
                "Unknown integration type: {}",
                other
            ))),
        }
    }

    /// Send the payload over HTTP
    ///
    /// GET forwards top-level scalar payload fields as query parameters;
    /// other methods send the payload as a JSON body.
    async fn send_http(&self, config: &Value, payload: &Value) -> Result<Value, IntegrationError> {
        let url = config
            .get("url")
            .and_then(|u| u.as_str())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| IntegrationError::ConfigInvalid("No URL specified".to_string()))?;

        let method = config
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("POST")
            .to_uppercase();

        tracing::debug!("🌍 HTTP request: {} {}", method, url);

        let mut request = match method.as_str() {
            "GET" => self.http.get(url).query(&scalar_query_pairs(payload)),
            "POST" => self.http.post(url).json(payload),
            "PUT" => self.http.put(url).json(payload),
            "DELETE" => self.http.delete(url).json(payload),
            other => {
                return Err(IntegrationError::ConfigInvalid(format!(
                    "Unsupported HTTP method: {}",
                    other
                )))
            }
        };

        if let Some(headers) = config.get("headers").and_then(|h| h.as_object()) {
            for (key, value) in headers {
                if let Some(text) = value.as_str() {
                    request = request.header(key, text);
                }
            }
        }

        let response = request
            .timeout(self.http_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IntegrationError::Transport(format!(
                        "Request timed out after {}s",
                        self.http_timeout.as_secs()
                    ))
                } else {
                    IntegrationError::Transport(format!("HTTP error: {}", e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IntegrationError::Transport(format!("Failed to read response body: {}", e)))?;
        let body_json: Option<Value> = serde_json::from_str(&body).ok();

        if status.is_success() {
            tracing::debug!("📡 HTTP request to {} succeeded with status {}", url, status);
            Ok(json!({
                "status": "success",
                "status_code": status.as_u16(),
                "response": body_json.unwrap_or(Value::String(body)),
            }))
        } else {
            Err(IntegrationError::Transport(format!(
                "HTTP request failed with status {}\nResponse content: {}",
                status.as_u16(),
                truncate_chars(&body, RESPONSE_SNIPPET_LIMIT)
            )))
        }
    }

    /// Publish the payload to an MQTT broker
    ///
    /// Connect and (for QoS > 0) publish acknowledgment each get a bounded
    /// wait; the failing stage names itself in the error message.
    async fn send_mqtt(&self, config: &Value, payload: &Value) -> Result<Value, IntegrationError> {
        let host = config
            .get("host")
            .and_then(|h| h.as_str())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| IntegrationError::ConfigInvalid("No MQTT host specified".to_string()))?;
        let topic = config
            .get("topic")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| IntegrationError::ConfigInvalid("No MQTT topic specified".to_string()))?;

        let port = config.get("port").and_then(|p| p.as_u64()).unwrap_or(1883) as u16;
        let qos_level = config.get("qos").and_then(|q| q.as_u64()).unwrap_or(0);
        let qos = match qos_level {
            0 => rumqttc::QoS::AtMostOnce,
            1 => rumqttc::QoS::AtLeastOnce,
            2 => rumqttc::QoS::ExactlyOnce,
            other => {
                return Err(IntegrationError::ConfigInvalid(format!(
                    "Invalid QoS level: {}",
                    other
                )))
            }
        };

        let client_id = format!("fieldflow-ingest-{}", uuid::Uuid::new_v4().simple());
        let mut options = rumqttc::MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (
            config.get("username").and_then(|u| u.as_str()),
            config.get("password").and_then(|p| p.as_str()),
        ) {
            options.set_credentials(username, password);
        }

        if config.get("use_ssl").and_then(|s| s.as_bool()).unwrap_or(false) {
            let ca = config
                .get("ca_cert")
                .and_then(|c| c.as_str())
                .map(|c| c.as_bytes().to_vec())
                .unwrap_or_default();
            let client_auth = match (
                config.get("client_cert").and_then(|c| c.as_str()),
                config.get("client_key").and_then(|k| k.as_str()),
            ) {
                (Some(cert), Some(key)) => {
                    Some((cert.as_bytes().to_vec(), key.as_bytes().to_vec()))
                }
                _ => None,
            };
            options.set_transport(rumqttc::Transport::Tls(rumqttc::TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }

        let timeout_secs = self.mqtt_timeout.as_secs();
        let (client, mut eventloop) = rumqttc::AsyncClient::new(options, 10);

        // Stage 1: connect
        tracing::debug!("🔌 Connecting to MQTT broker {}:{}", host, port);
        let connected = tokio::time::timeout(self.mqtt_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(ack))) => {
                        return Ok(ack)
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        let ack = match connected {
            Err(_) => {
                return Err(IntegrationError::Transport(format!(
                    "Connection timed out after {} seconds",
                    timeout_secs
                )))
            }
            Ok(Err(e)) => {
                return Err(IntegrationError::Transport(format!(
                    "Connection failed: {}",
                    e
                )))
            }
            Ok(Ok(ack)) => ack,
        };
        if ack.code != rumqttc::ConnectReturnCode::Success {
            return Err(IntegrationError::Transport(format!(
                "Connection failed with code {:?}",
                ack.code
            )));
        }

        // Stage 2: encode and publish
        let payload_bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = client.disconnect().await;
                return Err(IntegrationError::Transport(format!(
                    "Payload encoding failed: {}",
                    e
                )));
            }
        };

        tracing::debug!("📤 Publishing {} bytes to {}", payload_bytes.len(), topic);
        if let Err(e) = client.publish(topic, qos, false, payload_bytes).await {
            let _ = client.disconnect().await;
            return Err(IntegrationError::Transport(format!("MQTT error: {}", e)));
        }

        // Stage 3: wait for the broker acknowledgment when QoS requires one
        if qos_level > 0 {
            let acked = tokio::time::timeout(self.mqtt_timeout, async {
                loop {
                    match eventloop.poll().await {
                        Ok(rumqttc::Event::Incoming(rumqttc::Packet::PubAck(_)))
                        | Ok(rumqttc::Event::Incoming(rumqttc::Packet::PubComp(_))) => {
                            return Ok(())
                        }
                        Ok(_) => continue,
                        Err(e) => return Err(e),
                    }
                }
            })
            .await;

            match acked {
                Err(_) => {
                    let _ = client.disconnect().await;
                    return Err(IntegrationError::Transport(format!(
                        "Publish timed out after {} seconds",
                        timeout_secs
                    )));
                }
                Ok(Err(e)) => {
                    let _ = client.disconnect().await;
                    return Err(IntegrationError::Transport(format!("MQTT error: {}", e)));
                }
                Ok(Ok(())) => {}
            }
        }

        let _ = client.disconnect().await;
        tracing::debug!("✅ Published to MQTT topic {} at QoS {}", topic, qos_level);

        Ok(json!({
            "status": "success",
            "topic": topic,
            "qos": qos_level,
        }))
    }
}

/// Top-level scalar payload fields as query pairs for GET requests
fn scalar_query_pairs(payload: &Value) -> Vec<(String, String)> {
    match payload {
        Value::Object(map) => map
            .iter()
            .filter_map(|(key, value)| match value {
                Value::String(s) => Some((key.clone(), s.clone())),
                Value::Number(n) => Some((key.clone(), n.to_string())),
                Value::Bool(b) => Some((key.clone(), b.to_string())),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn executor() -> (IntegrationExecutor, Arc<EntityStore>, Arc<HistoryStore>) {
        let entity_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let history_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        let store = Arc::new(EntityStore::new(entity_pool));
        store.init_schema().await.unwrap();
        let history = Arc::new(HistoryStore::new(history_pool));
        history.init_schema().await.unwrap();

        let executor = IntegrationExecutor::new(
            Arc::clone(&store),
            Arc::clone(&history),
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        (executor, store, history)
    }

    fn integration_node(integration_id: i64) -> FlowNode {
        FlowNode {
            id: "i-node".to_string(),
            kind: crate::flow::types::NodeKind::Integration,
            data: json!({ "integrationId": integration_id })
                .as_object()
                .unwrap()
                .clone(),
        }
    }

    /// Local HTTP target echoing the request body, plus a failing route
    async fn spawn_http_target() -> std::net::SocketAddr {
        let app = axum::Router::new()
            .route(
                "/hook",
                post(|body: axum::Json<Value>| async move {
                    axum::Json(json!({"ok": true, "echo": body.0}))
                }),
            )
            .route(
                "/broken",
                post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream unavailable") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn unknown_transport_is_a_config_error_with_record() {
        let (executor, store, history) = executor().await;
        let id = store
            .save_integration("queue", "kafka", &json!({"brokers": "x"}))
            .await
            .unwrap();

        let outcome = executor
            .execute_integration_node(&integration_node(id), &json!({}), Some(1))
            .await;

        let err = outcome.result.unwrap_err();
        assert!(matches!(err, IntegrationError::ConfigInvalid(_)));
        assert!(err.to_string().contains("Unknown integration type: kafka"));

        let runs = history.integration_runs(id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "error");

        let integration = store.get_integration(id).await.unwrap().unwrap();
        assert_eq!(integration.status.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn http_requires_a_url() {
        let (executor, store, _) = executor().await;
        let id = store
            .save_integration("nourl", "http", &json!({}))
            .await
            .unwrap();

        let outcome = executor
            .execute_integration_node(&integration_node(id), &json!({}), None)
            .await;
        let err = outcome.result.unwrap_err();
        assert!(err.to_string().contains("No URL specified"));
    }

    #[tokio::test]
    async fn http_success_returns_parsed_body() {
        let (executor, store, history) = executor().await;
        let addr = spawn_http_target().await;
        let id = store
            .save_integration(
                "push",
                "http",
                &json!({"url": format!("http://{}/hook", addr), "method": "POST"}),
            )
            .await
            .unwrap();

        let outcome = executor
            .execute_integration_node(&integration_node(id), &json!({"x": 1}), Some(3))
            .await;

        let response = outcome.result.unwrap();
        assert_eq!(response["status"], "success");
        assert_eq!(response["status_code"], 200);
        assert_eq!(response["response"]["echo"], json!({"x": 1}));

        let runs = history.integration_runs(id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "success");
        assert_eq!(runs[0].flow_id, Some(3));

        let integration = store.get_integration(id).await.unwrap().unwrap();
        assert_eq!(integration.status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn http_non_2xx_embeds_status_and_body() {
        let (executor, store, history) = executor().await;
        let addr = spawn_http_target().await;
        let id = store
            .save_integration(
                "push",
                "http",
                &json!({"url": format!("http://{}/broken", addr)}),
            )
            .await
            .unwrap();

        let outcome = executor
            .execute_integration_node(&integration_node(id), &json!({}), None)
            .await;

        let err = outcome.result.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("502"));
        assert!(message.contains("upstream unavailable"));

        let runs = history.integration_runs(id).await.unwrap();
        assert_eq!(runs[0].status, "error");
        assert!(runs[0].error_message.as_deref().unwrap().contains("502"));
    }

    #[tokio::test]
    async fn http_transport_failure_is_an_error() {
        let (executor, store, _) = executor().await;
        let id = store
            .save_integration("dead", "http", &json!({"url": "http://127.0.0.1:1/hook"}))
            .await
            .unwrap();

        let outcome = executor
            .execute_integration_node(&integration_node(id), &json!({}), None)
            .await;
        let err = outcome.result.unwrap_err();
        assert!(matches!(err, IntegrationError::Transport(_)));
    }

    #[tokio::test]
    async fn mqtt_requires_host_and_topic() {
        let (executor, store, _) = executor().await;

        let id = store
            .save_integration("nohost", "mqtt", &json!({"topic": "t"}))
            .await
            .unwrap();
        let outcome = executor
            .execute_integration_node(&integration_node(id), &json!({}), None)
            .await;
        assert!(outcome.result.unwrap_err().to_string().contains("No MQTT host"));

        let id = store
            .save_integration("notopic", "mqtt", &json!({"host": "broker.test"}))
            .await
            .unwrap();
        let outcome = executor
            .execute_integration_node(&integration_node(id), &json!({}), None)
            .await;
        assert!(outcome.result.unwrap_err().to_string().contains("No MQTT topic"));
    }

    #[tokio::test]
    async fn mqtt_rejects_invalid_qos() {
        let (executor, store, _) = executor().await;
        let id = store
            .save_integration(
                "badqos",
                "mqtt",
                &json!({"host": "broker.test", "topic": "t", "qos": 5}),
            )
            .await
            .unwrap();

        let outcome = executor
            .execute_integration_node(&integration_node(id), &json!({}), None)
            .await;
        let err = outcome.result.unwrap_err();
        assert!(matches!(err, IntegrationError::ConfigInvalid(_)));
        assert!(err.to_string().contains("Invalid QoS level: 5"));
    }

    #[tokio::test]
    async fn unknown_integration_produces_error_without_record() {
        let (executor, _, history) = executor().await;
        let outcome = executor
            .execute_integration_node(&integration_node(404), &json!({}), None)
            .await;

        assert!(matches!(
            outcome.result,
            Err(IntegrationError::IntegrationNotFound(404))
        ));
        assert!(outcome.record_id.is_none());
        assert!(history.integration_runs(404).await.unwrap().is_empty());
    }

    #[test]
    fn query_pairs_keep_only_scalars() {
        let pairs = scalar_query_pairs(&json!({
            "a": "x", "b": 2, "c": true, "nested": {"d": 1}, "list": [1]
        }));
        assert_eq!(pairs.len(), 3);
        assert!(pairs.contains(&("b".to_string(), "2".to_string())));
    }
}
