/// Flow graph traversal
///
/// Walks a flow depth-first from a starting node, executing function and
/// integration nodes and propagating the payload along edges in declaration
/// order. Node failures never escape as Rust errors; they are captured into
/// the result tree and annotated onto ancestors.

use crate::engine::context::ExecutionContext;
use crate::engine::FlowEngine;
use crate::flow::types::{Flow, NodeKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// Per-node traversal outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Processed,
    Skipped,
    Error,
}

/// One node of the execution result tree
///
/// Mirrors the traversal: `next_nodes` holds the sub-results of every
/// outgoing edge, in the order the edges were declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeKind>,
    pub status: NodeStatus,
    /// Reason for a skip ("already_processed") or a structural failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Payload produced by a function node, propagated to its children
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_history_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration_history_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_nodes: Vec<NodeResult>,
}

impl NodeResult {
    fn new(node_id: String, node_type: Option<NodeKind>) -> Self {
        Self {
            node_id,
            node_type,
            status: NodeStatus::Processed,
            reason: None,
            error: None,
            modified_payload: None,
            function_history_id: None,
            integration_history_id: None,
            next_nodes: Vec::new(),
        }
    }

    fn skipped(node_id: String) -> Self {
        Self {
            status: NodeStatus::Skipped,
            reason: Some("already_processed".to_string()),
            ..Self::new(node_id, None)
        }
    }

    fn not_found(node_id: String, flow_id: i64) -> Self {
        Self {
            status: NodeStatus::Error,
            reason: Some("node_not_found".to_string()),
            error: Some(format!("Node {} not found in flow {}", node_id, flow_id)),
            ..Self::new(node_id, None)
        }
    }
}

/// Payload that reached the deepest/last node of a result tree
///
/// The node's own modified payload if present, else the payload extracted
/// from its last child in declaration order, else the incoming payload.
/// Sibling outputs are deliberately discarded; this feeds a single-consumer
/// audit field.
pub fn extract_last_node_payload(result: &NodeResult, original: &Value) -> Value {
    let current = result
        .modified_payload
        .clone()
        .unwrap_or_else(|| original.clone());

    match result.next_nodes.last() {
        Some(last_child) => extract_last_node_payload(last_child, &current),
        None => current,
    }
}

impl FlowEngine {
    /// Process a flow starting from a specific node
    ///
    /// The context's visited set is shared across the whole root invocation
    /// and is never reset mid-walk; a revisited node terminates its branch
    /// with a skip. Branches under one invocation are evaluated strictly
    /// left to right.
    pub fn traverse<'a>(
        &'a self,
        flow: &'a Flow,
        node_id: String,
        payload: Value,
        ctx: &'a mut ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = NodeResult> + Send + 'a>> {
        Box::pin(async move {
            tracing::debug!("🧭 Processing node {} in flow {} ({})", node_id, flow.id, flow.name);

            if ctx.visited.contains(&node_id) {
                tracing::debug!("⏭️ Node {} already processed, skipping to prevent loop", node_id);
                return NodeResult::skipped(node_id);
            }
            ctx.mark_visited(&node_id);

            let Some(node) = flow.node(&node_id) else {
                tracing::error!("❌ Node {} not found in flow {}", node_id, flow.id);
                return NodeResult::not_found(node_id, flow.id);
            };

            let mut result = NodeResult::new(node_id.clone(), Some(node.kind));

            match node.kind {
                // Trigger anchors pass the payload through unchanged
                NodeKind::Device | NodeKind::Label => {}
                NodeKind::Function => {
                    let outcome = self
                        .scripts
                        .execute_function_node(node, &payload, Some(flow.id))
                        .await;
                    result.function_history_id = outcome.record_id;
                    match outcome.result {
                        Ok(modified) => result.modified_payload = Some(modified),
                        Err(e) => {
                            result.status = NodeStatus::Error;
                            result.error = Some(e.to_string());
                        }
                    }
                }
                NodeKind::Integration => {
                    let outcome = self
                        .integrations
                        .execute_integration_node(node, &payload, Some(flow.id))
                        .await;
                    result.integration_history_id = outcome.record_id;
                    if let Err(e) = outcome.result {
                        result.status = NodeStatus::Error;
                        result.error = Some(e.to_string());
                    }
                }
            }

            // Function nodes feed their output downstream, everything else
            // forwards the incoming payload
            let next_payload = result
                .modified_payload
                .clone()
                .unwrap_or_else(|| payload.clone());

            for edge in flow.outgoing_edges(&node_id) {
                let target = edge.target.clone();
                let child = self
                    .traverse(flow, target.clone(), next_payload.clone(), &mut *ctx)
                    .await;

                if child.status == NodeStatus::Error && result.status != NodeStatus::Error {
                    // First failing child wins; an existing error is never
                    // overwritten
                    result.status = NodeStatus::Error;
                    result.error = Some(format!(
                        "Error in downstream node {}: {}",
                        target,
                        child.error.as_deref().unwrap_or("Unknown error")
                    ));
                    tracing::debug!("⬆️ Propagating error from downstream node {}", target);
                }

                result.next_nodes.push(child);
            }

            if ctx.is_root {
                let status = if result.status == NodeStatus::Error {
                    "error"
                } else {
                    "success"
                };
                if let Err(e) = self.store.update_flow_status(flow.id, status).await {
                    tracing::warn!("⚠️ Could not update flow {} status: {}", flow.id, e);
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FlowEngine;
    use crate::flow::store::EntityStore;
    use crate::flow::types::{Edge, FlowNode};
    use crate::history::store::HistoryStore;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;
    use std::time::Duration;

    async fn engine() -> (FlowEngine, Arc<EntityStore>, Arc<HistoryStore>) {
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

        let engine = FlowEngine::new(
            Arc::clone(&store),
            Arc::clone(&history),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        (engine, store, history)
    }

    fn node(id: &str, kind: NodeKind, data: Value) -> FlowNode {
        FlowNode {
            id: id.to_string(),
            kind,
            data: data.as_object().unwrap().clone(),
        }
    }

    fn edge(source: &str, target: &str) -> Edge {
        Edge {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    #[tokio::test]
    async fn cycle_terminates_with_skip() {
        let (engine, _, _) = engine().await;
        let flow = Flow {
            id: 1,
            name: "cycle".to_string(),
            nodes: vec![
                node("a", NodeKind::Device, json!({"deviceId": 1})),
                node("b", NodeKind::Device, json!({"deviceId": 2})),
            ],
            edges: vec![edge("a", "b"), edge("b", "a")],
            status: None,
        };

        let mut ctx = ExecutionContext::new(None);
        let result = engine
            .traverse(&flow, "a".to_string(), json!({"x": 1}), &mut ctx)
            .await;

        assert_eq!(result.status, NodeStatus::Processed);
        let b = &result.next_nodes[0];
        assert_eq!(b.status, NodeStatus::Processed);
        let a_again = &b.next_nodes[0];
        assert_eq!(a_again.status, NodeStatus::Skipped);
        assert_eq!(a_again.reason.as_deref(), Some("already_processed"));
        assert!(a_again.next_nodes.is_empty());
    }

    #[tokio::test]
    async fn missing_node_is_a_terminal_error() {
        let (engine, _, _) = engine().await;
        let flow = Flow {
            id: 2,
            name: "dangling".to_string(),
            nodes: vec![node("a", NodeKind::Device, json!({"deviceId": 1}))],
            edges: vec![edge("a", "ghost")],
            status: None,
        };

        let mut ctx = ExecutionContext::new(None);
        let result = engine
            .traverse(&flow, "a".to_string(), json!({}), &mut ctx)
            .await;

        assert_eq!(result.status, NodeStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("ghost"));
        let ghost = &result.next_nodes[0];
        assert_eq!(ghost.status, NodeStatus::Error);
        assert_eq!(ghost.reason.as_deref(), Some("node_not_found"));
    }

    #[tokio::test]
    async fn function_output_feeds_downstream_nodes() {
        let (engine, store, _) = engine().await;
        let function_id = store
            .save_function("inc", "function process(input) return { y = input.x + 1 } end")
            .await
            .unwrap();

        let flow = Flow {
            id: 3,
            name: "transform".to_string(),
            nodes: vec![
                node("f1", NodeKind::Function, json!({"functionId": function_id})),
                node("d2", NodeKind::Device, json!({"deviceId": 9})),
            ],
            edges: vec![edge("f1", "d2")],
            status: None,
        };

        let mut ctx = ExecutionContext::new(None);
        let result = engine
            .traverse(&flow, "f1".to_string(), json!({"x": 1}), &mut ctx)
            .await;

        assert_eq!(result.status, NodeStatus::Processed);
        assert_eq!(result.modified_payload, Some(json!({"y": 2})));
        assert!(result.function_history_id.is_some());

        let last = extract_last_node_payload(&result, &json!({"x": 1}));
        assert_eq!(last, json!({"y": 2}));
    }

    #[tokio::test]
    async fn downstream_error_annotates_ancestor_without_overwrite() {
        let (engine, _, _) = engine().await;
        // Integration id 404 does not exist, the node will fail
        let flow = Flow {
            id: 4,
            name: "failing sink".to_string(),
            nodes: vec![
                node("d1", NodeKind::Device, json!({"deviceId": 1})),
                node("i1", NodeKind::Integration, json!({"integrationId": 404})),
            ],
            edges: vec![edge("d1", "i1")],
            status: None,
        };

        let mut ctx = ExecutionContext::new(None);
        let result = engine
            .traverse(&flow, "d1".to_string(), json!({}), &mut ctx)
            .await;

        assert_eq!(result.status, NodeStatus::Error);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .starts_with("Error in downstream node i1"));
        assert_eq!(result.next_nodes[0].status, NodeStatus::Error);
    }

    #[tokio::test]
    async fn root_call_updates_flow_entity_status() {
        let (engine, store, _) = engine().await;
        let nodes = vec![node("d1", NodeKind::Device, json!({"deviceId": 1}))];
        let flow_id = store.save_flow("rooted", &nodes, &[]).await.unwrap();
        let flow = store.get_flow(flow_id).await.unwrap().unwrap();

        let mut ctx = ExecutionContext::new(None);
        ctx.is_root = true;
        let result = engine
            .traverse(&flow, "d1".to_string(), json!({}), &mut ctx)
            .await;

        assert_eq!(result.status, NodeStatus::Processed);
        let stored = store.get_flow(flow_id).await.unwrap().unwrap();
        assert_eq!(stored.status.as_deref(), Some("success"));
    }

    #[test]
    fn last_payload_takes_last_child_in_declaration_order() {
        let leaf_one = NodeResult {
            modified_payload: Some(json!({"branch": 1})),
            ..NodeResult::new("b1".to_string(), Some(NodeKind::Function))
        };
        let leaf_two = NodeResult {
            modified_payload: Some(json!({"branch": 2})),
            ..NodeResult::new("b2".to_string(), Some(NodeKind::Function))
        };
        let root = NodeResult {
            next_nodes: vec![leaf_one, leaf_two],
            ..NodeResult::new("root".to_string(), Some(NodeKind::Device))
        };

        let original = json!({"original": true});
        assert_eq!(extract_last_node_payload(&root, &original), json!({"branch": 2}));

        let lonely = NodeResult::new("leaf".to_string(), Some(NodeKind::Device));
        assert_eq!(extract_last_node_payload(&lonely, &original), original);
    }
}
