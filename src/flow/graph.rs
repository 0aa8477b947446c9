/// Petgraph-backed structural view of a flow
///
/// Builds a directed graph from a flow definition for structural checks:
/// edges that reference unknown nodes, and cycles. Unlike a strict DAG
/// pipeline, stored flows may legitimately contain cycles; the traversal
/// engine tolerates them with its visited set, so a cycle here is a warning,
/// not a rejection.

use crate::flow::types::Flow;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Structural view of a flow as a petgraph DiGraph
#[derive(Debug)]
pub struct FlowGraph {
    graph: DiGraph<String, ()>,
    node_id_to_index: HashMap<String, NodeIndex>,
    /// Edges whose source or target does not exist in the node set
    dangling_edges: Vec<(String, String)>,
}

impl FlowGraph {
    /// Build the structural view from a flow definition
    ///
    /// Edges with unknown endpoints are collected rather than rejected; the
    /// traversal engine reports them as node-not-found results when reached.
    pub fn build(flow: &Flow) -> Self {
        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();

        for node in &flow.nodes {
            let index = graph.add_node(node.id.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        let mut dangling_edges = Vec::new();
        for edge in &flow.edges {
            match (
                node_id_to_index.get(&edge.source),
                node_id_to_index.get(&edge.target),
            ) {
                (Some(source), Some(target)) => {
                    graph.add_edge(*source, *target, ());
                }
                _ => dangling_edges.push((edge.source.clone(), edge.target.clone())),
            }
        }

        Self {
            graph,
            node_id_to_index,
            dangling_edges,
        }
    }

    /// Whether the flow contains at least one cycle
    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Edges referencing nodes that do not exist in this flow
    pub fn dangling_edges(&self) -> &[(String, String)] {
        &self.dangling_edges
    }

    /// Whether a node id exists in the flow
    pub fn contains(&self, node_id: &str) -> bool {
        self.node_id_to_index.contains_key(node_id)
    }

    /// Log structural findings for a flow about to be executed
    pub fn warn_on_defects(&self, flow: &Flow) {
        if self.has_cycle() {
            tracing::warn!(
                "🔁 Flow {} ({}) contains a cycle, visited-set guard will bound traversal",
                flow.id,
                flow.name
            );
        }
        for (source, target) in &self.dangling_edges {
            tracing::warn!(
                "⚠️ Flow {} has edge {} → {} referencing an unknown node",
                flow.id,
                source,
                target
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{Edge, FlowNode, NodeKind};
    use serde_json::Map;

    fn flow_with(nodes: &[&str], edges: &[(&str, &str)]) -> Flow {
        Flow {
            id: 1,
            name: "structural".to_string(),
            nodes: nodes
                .iter()
                .map(|id| FlowNode {
                    id: id.to_string(),
                    kind: NodeKind::Function,
                    data: Map::new(),
                })
                .collect(),
            edges: edges
                .iter()
                .map(|(s, t)| Edge {
                    source: s.to_string(),
                    target: t.to_string(),
                })
                .collect(),
            status: None,
        }
    }

    #[test]
    fn detects_cycles() {
        let flow = flow_with(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let graph = FlowGraph::build(&flow);
        assert!(graph.has_cycle());
        assert!(graph.dangling_edges().is_empty());
    }

    #[test]
    fn collects_dangling_edges() {
        let flow = flow_with(&["a"], &[("a", "missing")]);
        let graph = FlowGraph::build(&flow);
        assert!(!graph.has_cycle());
        assert_eq!(
            graph.dangling_edges(),
            &[("a".to_string(), "missing".to_string())]
        );
        assert!(graph.contains("a"));
        assert!(!graph.contains("missing"));
    }
}
