/// Audit record types
///
/// One flow record per root invocation, one script/integration record per
/// node execution, and one label record per participating label. Records are
/// append-only; a finalized record is never mutated again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Overall outcome of one root invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRunStatus {
    Running,
    Success,
    PartialSuccess,
    Error,
}

impl FlowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowRunStatus::Running => "running",
            FlowRunStatus::Success => "success",
            FlowRunStatus::PartialSuccess => "partial_success",
            FlowRunStatus::Error => "error",
        }
    }
}

/// Outcome of one node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Running,
    Success,
    Error,
}

impl NodeRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRunStatus::Running => "running",
            NodeRunStatus::Success => "success",
            NodeRunStatus::Error => "error",
        }
    }
}

/// Persisted audit row for one root invocation of a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecutionRecord {
    pub id: i64,
    pub flow_id: i64,
    pub status: String,
    pub trigger_source: Option<String>,
    pub source_id: Option<i64>,
    pub execution_path: Option<Value>,
    pub error_details: Option<Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
}

/// Persisted audit row for one script-node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptExecutionRecord {
    pub id: i64,
    pub function_id: i64,
    pub flow_id: Option<i64>,
    pub status: String,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
}

/// Persisted audit row for one integration-node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationExecutionRecord {
    pub id: i64,
    pub integration_id: i64,
    pub flow_id: Option<i64>,
    pub status: String,
    pub input_data: Option<Value>,
    pub response_data: Option<Value>,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
}

/// Persisted participation row for a label involved in a root invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelParticipationRecord {
    pub id: i64,
    pub label_id: i64,
    pub flow_id: Option<i64>,
    pub event: String,
    pub status: Option<String>,
    pub data: Option<Value>,
}
