/// Trigger resolution for inbound device events
///
/// Matches an event's originating device (id + EUI) and its label ids
/// against the trigger anchors of a flow. The same matching policy drives
/// two decisions: which flows are relevant to an event at all, and which
/// nodes inside a selected flow start the traversal.

use crate::flow::types::{attr_text, Flow, FlowNode, NodeKind};
use std::collections::HashSet;

/// Find the trigger nodes in a flow that identify the uplinking device
///
/// Device nodes match when any of their `[deviceId, entityId, id]` values
/// string-compares equal to the device id, or when their `label` attribute
/// equals the device EUI. Label nodes match when any of their
/// `[labelId, entityId, id]` values resolves (integer first, string
/// fallback) to one of the device's label ids. A node is added at most
/// once, on the first rule that matches.
pub fn find_trigger_nodes(
    flow: &Flow,
    device_id: i64,
    device_eui: &str,
    label_ids: &[i64],
) -> Vec<String> {
    let mut trigger_nodes = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for node in &flow.nodes {
        if !matches!(node.kind, NodeKind::Device | NodeKind::Label) {
            continue;
        }
        if seen.contains(node.id.as_str()) {
            continue;
        }

        let matched = match node.kind {
            NodeKind::Device => device_node_matches(node, device_id, device_eui),
            NodeKind::Label => label_node_matches(node, label_ids),
            _ => false,
        };

        if matched {
            tracing::debug!("🎯 Trigger node {} matches device {} ({})", node.id, device_id, device_eui);
            seen.insert(node.id.as_str());
            trigger_nodes.push(node.id.clone());
        }
    }

    trigger_nodes
}

/// Select the flows relevant to an event, deduplicated by flow id
///
/// Scans every stored flow with the per-node matching policy; a flow is a
/// candidate as soon as one of its nodes matches. Input order is preserved.
pub fn flows_for_event<'a>(
    flows: &'a [Flow],
    device_id: i64,
    device_eui: &str,
    label_ids: &[i64],
) -> Vec<&'a Flow> {
    let mut matched = Vec::new();
    let mut added_flow_ids = HashSet::new();

    for flow in flows {
        if added_flow_ids.contains(&flow.id) {
            continue;
        }
        if flow.nodes.is_empty() {
            tracing::debug!("⏭️ Flow {} has no nodes, skipping", flow.id);
            continue;
        }
        if !find_trigger_nodes(flow, device_id, device_eui, label_ids).is_empty() {
            added_flow_ids.insert(flow.id);
            matched.push(flow);
        }
    }

    matched
}

fn device_node_matches(node: &FlowNode, device_id: i64, device_eui: &str) -> bool {
    let device_id_text = device_id.to_string();
    for value in node.candidate_refs("deviceId") {
        if attr_text(value) == device_id_text {
            return true;
        }
    }

    // Older editors stored the EUI in the node label instead of an id field
    if let Some(label) = node.data.get("label") {
        if attr_text(label).trim() == device_eui {
            return true;
        }
    }

    false
}

fn label_node_matches(node: &FlowNode, label_ids: &[i64]) -> bool {
    if label_ids.is_empty() {
        return false;
    }

    for value in node.candidate_refs("labelId") {
        let text = attr_text(value);
        // Integer coercion first; stored ids may be client-supplied strings,
        // so a failed parse falls back to string comparison
        match text.trim().parse::<i64>() {
            Ok(id) => {
                if label_ids.contains(&id) {
                    return true;
                }
            }
            Err(_) => {
                if label_ids.iter().any(|id| id.to_string() == text) {
                    return true;
                }
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{Edge, FlowNode};
    use serde_json::{json, Value};

    fn node(id: &str, kind: NodeKind, data: Value) -> FlowNode {
        FlowNode {
            id: id.to_string(),
            kind,
            data: data.as_object().unwrap().clone(),
        }
    }

    fn flow(nodes: Vec<FlowNode>) -> Flow {
        Flow {
            id: 1,
            name: "triggers".to_string(),
            nodes,
            edges: Vec::<Edge>::new(),
            status: None,
        }
    }

    #[test]
    fn device_node_matches_int_and_string_ids_identically() {
        let by_string = flow(vec![node("d1", NodeKind::Device, json!({"entityId": "42"}))]);
        let by_number = flow(vec![node("d1", NodeKind::Device, json!({"entityId": 42}))]);

        assert_eq!(find_trigger_nodes(&by_string, 42, "EUI", &[]), vec!["d1"]);
        assert_eq!(find_trigger_nodes(&by_number, 42, "EUI", &[]), vec!["d1"]);
    }

    #[test]
    fn device_node_matches_eui_via_label_attribute() {
        let f = flow(vec![node(
            "d1",
            NodeKind::Device,
            json!({"deviceId": 99, "label": " A1B2C3D4E5F60708 "}),
        )]);
        assert_eq!(
            find_trigger_nodes(&f, 42, "A1B2C3D4E5F60708", &[]),
            vec!["d1"]
        );
    }

    #[test]
    fn label_node_integer_coercion_with_string_fallback() {
        let numeric = flow(vec![node("l1", NodeKind::Label, json!({"labelId": "7"}))]);
        assert_eq!(find_trigger_nodes(&numeric, 1, "EUI", &[7]), vec!["l1"]);

        // Non-numeric stored id must not crash and must never match numeric labels
        let odd = flow(vec![node("l1", NodeKind::Label, json!({"labelId": "7x"}))]);
        assert!(find_trigger_nodes(&odd, 1, "EUI", &[7]).is_empty());
    }

    #[test]
    fn label_node_ignored_without_event_labels() {
        let f = flow(vec![node("l1", NodeKind::Label, json!({"labelId": 7}))]);
        assert!(find_trigger_nodes(&f, 1, "EUI", &[]).is_empty());
    }

    #[test]
    fn node_added_once_even_when_multiple_rules_match() {
        let f = flow(vec![node(
            "d1",
            NodeKind::Device,
            json!({"deviceId": 42, "entityId": "42", "label": "EUI"}),
        )]);
        assert_eq!(find_trigger_nodes(&f, 42, "EUI", &[]), vec!["d1"]);
    }

    #[test]
    fn non_trigger_nodes_never_match() {
        let f = flow(vec![node("f1", NodeKind::Function, json!({"id": 42}))]);
        assert!(find_trigger_nodes(&f, 42, "EUI", &[]).is_empty());
    }

    #[test]
    fn flow_selection_deduplicates_by_id() {
        let matching = Flow {
            id: 1,
            name: "a".to_string(),
            nodes: vec![
                node("d1", NodeKind::Device, json!({"deviceId": 5})),
                node("l1", NodeKind::Label, json!({"labelId": 3})),
            ],
            edges: Vec::new(),
            status: None,
        };
        let other = Flow {
            id: 2,
            name: "b".to_string(),
            nodes: vec![node("d9", NodeKind::Device, json!({"deviceId": 99}))],
            edges: Vec::new(),
            status: None,
        };

        let flows = vec![matching, other];
        let selected = flows_for_event(&flows, 5, "EUI", &[3]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, 1);
    }
}
