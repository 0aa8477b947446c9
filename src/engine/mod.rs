/// Flow execution engine
///
/// Root orchestration for one inbound event against one flow: open the
/// flow-level audit record, resolve trigger nodes, walk every branch
/// sequentially with a shared visited set, aggregate branch outcomes into
/// an overall status, and finalize the record. This module is the sole
/// entry point the ingest boundary calls into.

pub mod context;
pub mod error;
pub mod integration;
pub mod script;
pub mod traversal;
pub mod trigger;

pub use context::ExecutionContext;
pub use error::{IntegrationError, ScriptError};
pub use integration::IntegrationExecutor;
pub use script::ScriptExecutor;
pub use traversal::{extract_last_node_payload, NodeResult, NodeStatus};
pub use trigger::{find_trigger_nodes, flows_for_event};

use crate::flow::graph::FlowGraph;
use crate::flow::store::EntityStore;
use crate::flow::types::Flow;
use crate::history::records::FlowRunStatus;
use crate::history::store::{safe_serialize, HistoryStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One traversed branch of a root invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchExecution {
    /// Trigger node the branch started from
    pub trigger_node: String,
    /// First node actually executed (the trigger's edge target)
    pub target_node: String,
    /// Result tree of the branch
    pub result: NodeResult,
}

/// One branch-level failure, kept for the flow record's error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchError {
    pub node_id: String,
    pub error: String,
}

/// Aggregated outcome of one root invocation, returned to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecutionSummary {
    pub status: FlowRunStatus,
    pub flow_id: i64,
    pub flow_name: String,
    pub flow_history_id: Option<i64>,
    pub execution_time_ms: i64,
    pub results: Vec<BranchExecution>,
    /// None when no branch failed
    pub errors: Option<Vec<BranchError>>,
    /// Payload that reached the deepest/last node visited
    pub last_node_payload: Option<Value>,
}

/// Orchestrates node executors, the entity store, and the audit trail
#[derive(Debug, Clone)]
pub struct FlowEngine {
    pub(crate) store: Arc<EntityStore>,
    pub(crate) history: Arc<HistoryStore>,
    pub(crate) scripts: ScriptExecutor,
    pub(crate) integrations: IntegrationExecutor,
}

impl FlowEngine {
    pub fn new(
        store: Arc<EntityStore>,
        history: Arc<HistoryStore>,
        script_timeout: Duration,
        http_timeout: Duration,
        mqtt_timeout: Duration,
    ) -> Self {
        let scripts = ScriptExecutor::new(Arc::clone(&store), Arc::clone(&history), script_timeout);
        let integrations = IntegrationExecutor::new(
            Arc::clone(&store),
            Arc::clone(&history),
            http_timeout,
            mqtt_timeout,
        );
        Self {
            store,
            history,
            scripts,
            integrations,
        }
    }

    /// Execute a flow for a single inbound device event
    ///
    /// Branches (trigger nodes × their outgoing edges) are evaluated
    /// sequentially in declaration order against one shared visited set, so
    /// cross-branch cycles are caught. Node failures surface in the summary
    /// as partial or full errors, never as an Err from this function.
    pub async fn run_flow(
        &self,
        flow: &Flow,
        device_id: i64,
        device_eui: &str,
        payload: &Value,
        label_ids: &[i64],
    ) -> FlowExecutionSummary {
        tracing::info!(
            "🚀 Starting execution for device {} ({}) in flow {} ({})",
            device_id,
            device_eui,
            flow.id,
            flow.name
        );
        let started = Instant::now();
        let start_time = Utc::now();

        FlowGraph::build(flow).warn_on_defects(flow);

        let flow_history_id = self
            .history
            .begin_flow_run(flow.id, "device_uplink", device_id, start_time)
            .await;

        // Label participation records; failures here never abort the flow
        for label_id in label_ids {
            self.history
                .record_label_event(
                    *label_id,
                    Some(flow.id),
                    "flow_execution",
                    "success",
                    &json!({
                        "flow_id": flow.id,
                        "flow_name": flow.name,
                        "device_id": device_id,
                        "device_eui": device_eui,
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
                .await;
        }

        let trigger_nodes = find_trigger_nodes(flow, device_id, device_eui, label_ids);
        tracing::info!(
            "🎯 Found {} trigger nodes in flow {}: {:?}",
            trigger_nodes.len(),
            flow.id,
            trigger_nodes
        );

        let mut ctx = ExecutionContext::new(flow_history_id);
        let mut execution_path: Vec<BranchExecution> = Vec::new();
        let mut errors: Vec<BranchError> = Vec::new();
        let mut last_node_payload: Option<Value> = None;

        for trigger_node_id in &trigger_nodes {
            for edge in flow.outgoing_edges(trigger_node_id) {
                let target = edge.target.clone();
                tracing::debug!("🧵 Processing branch {} → {}", trigger_node_id, target);

                let result = self
                    .traverse(flow, target.clone(), payload.clone(), &mut ctx)
                    .await;

                last_node_payload = Some(extract_last_node_payload(&result, payload));

                if result.status == NodeStatus::Error {
                    let message = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string());
                    tracing::warn!("⚠️ Branch to node {} failed: {}", target, message);
                    errors.push(BranchError {
                        node_id: target.clone(),
                        error: message,
                    });
                }

                execution_path.push(BranchExecution {
                    trigger_node: trigger_node_id.clone(),
                    target_node: target,
                    result,
                });
            }
        }

        let status = if errors.is_empty() {
            FlowRunStatus::Success
        } else if errors.len() == execution_path.len() {
            FlowRunStatus::Error
        } else {
            FlowRunStatus::PartialSuccess
        };

        let execution_time_ms = started.elapsed().as_millis() as i64;

        if let Some(record_id) = flow_history_id {
            let error_details = if errors.is_empty() {
                None
            } else {
                Some(safe_serialize(&errors))
            };
            self.history
                .finalize_flow_run(
                    record_id,
                    status,
                    &safe_serialize(&execution_path),
                    error_details.as_ref(),
                    payload,
                    last_node_payload.as_ref(),
                    Utc::now(),
                    execution_time_ms,
                )
                .await;
        }

        // Last-execution status on the flow entity, best effort
        let entity_status = if status == FlowRunStatus::Error {
            "error"
        } else {
            "success"
        };
        if let Err(e) = self.store.update_flow_status(flow.id, entity_status).await {
            tracing::warn!("⚠️ Could not update flow {} status: {}", flow.id, e);
        }

        match status {
            FlowRunStatus::Success => tracing::info!(
                "🎉 Flow {} ({}) executed successfully in {}ms",
                flow.name,
                flow.id,
                execution_time_ms
            ),
            FlowRunStatus::PartialSuccess => tracing::warn!(
                "⚠️ Flow {} ({}) partially succeeded in {}ms with {} errors",
                flow.name,
                flow.id,
                execution_time_ms,
                errors.len()
            ),
            _ => tracing::error!(
                "❌ Flow {} ({}) failed in {}ms",
                flow.name,
                flow.id,
                execution_time_ms
            ),
        }

        FlowExecutionSummary {
            status,
            flow_id: flow.id,
            flow_name: flow.name.clone(),
            flow_history_id,
            execution_time_ms,
            results: execution_path,
            errors: if errors.is_empty() { None } else { Some(errors) },
            last_node_payload,
        }
    }
}
