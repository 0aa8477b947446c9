/// Core flow type definitions
///
/// Defines the structures for flows, nodes, and edges. Flow definitions are
/// serialized/deserialized from JSON columns in SQLite, so every field that
/// comes from the editor is tolerant of missing keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete flow definition containing nodes and their connections
///
/// Flows are stored as JSON in SQLite and walked directly by the traversal
/// engine. Edges form a general directed graph; cycles are possible in stored
/// definitions and are tolerated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Unique flow identifier
    pub id: i64,
    /// Human-readable flow name
    pub name: String,
    /// List of nodes in this flow
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    /// List of edges connecting nodes
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Last execution status ("success" / "error"), updated as a side effect
    /// of each root invocation
    #[serde(default)]
    pub status: Option<String>,
}

impl Flow {
    /// Find a node by its id
    pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Outgoing edges from a node, in declaration order
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }
}

/// A single node in a flow graph
///
/// The `data` map holds type-specific identifiers under redundant keys: an
/// entity reference may appear under `deviceId`, `entityId`, or plain `id`
/// depending on which editor version produced the flow. That redundancy is a
/// compatibility contract, not noise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    /// Unique node identifier within the flow (e.g., "n1", "device-4")
    pub id: String,
    /// The type of node which determines execution behavior
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Node-specific attributes as flexible JSON
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

impl FlowNode {
    /// Resolve an entity reference from the attribute map.
    ///
    /// Checks the fixed preference order `[specific, "entityId", "id"]` and
    /// returns the first key that is present, regardless of its value.
    pub fn entity_ref(&self, specific: &str) -> Option<&Value> {
        for key in [specific, "entityId", "id"] {
            if let Some(value) = self.data.get(key) {
                return Some(value);
            }
        }
        None
    }

    /// Resolve an entity reference and coerce it to a numeric id.
    ///
    /// Stored ids may be client-supplied strings ("42"), so numeric strings
    /// are parsed; anything else is treated as unresolvable.
    pub fn entity_id(&self, specific: &str) -> Option<i64> {
        match self.entity_ref(specific)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// All present id-field values for trigger matching, in preference order
    pub fn candidate_refs(&self, specific: &str) -> Vec<&Value> {
        [specific, "entityId", "id"]
            .iter()
            .filter_map(|key| self.data.get(*key))
            .collect()
    }
}

/// Available node types for the flow engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Trigger anchor matched against the uplinking device
    Device,
    /// Trigger anchor matched against the device's labels
    Label,
    /// Lua transform executed against the current payload
    Function,
    /// External dispatch over HTTP or MQTT
    Integration,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Device => "device",
            NodeKind::Label => "label",
            NodeKind::Function => "function",
            NodeKind::Integration => "integration",
        }
    }
}

/// Connection between two nodes in a flow graph
///
/// Edges define the direction the payload travels. The traversal engine
/// follows them in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Source node ID
    pub source: String,
    /// Target node ID
    pub target: String,
}

/// String form of an attribute value for type-tolerant comparisons
///
/// Ids arrive as numbers or strings depending on the editor version, so
/// both sides of a comparison are coerced to text first.
pub fn attr_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A stored Lua transform function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: i64,
    pub name: String,
    /// Lua source; a function with no code cannot be executed
    pub code: Option<String>,
    pub status: Option<String>,
}

/// A stored integration endpoint (HTTP or MQTT)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: i64,
    pub name: String,
    /// Transport kind: "http" or "mqtt"
    #[serde(rename = "type")]
    pub kind: String,
    /// Transport-specific configuration
    pub config: Value,
    pub status: Option<String>,
}

/// A registered field device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    /// Device EUI, stored and matched uppercase
    pub dev_eui: String,
    pub status: Option<String>,
    /// Expected transmit interval in minutes, drives the online TTL
    pub expected_transmit_interval: Option<i64>,
}
