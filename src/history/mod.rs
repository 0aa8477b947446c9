/// Execution history layer
///
/// Audit record types and the SQLite store that persists them. All writes
/// are serialization-safe and best-effort; see store.rs for the degradation
/// policy.

pub mod records;
pub mod store;

pub use records::{
    FlowExecutionRecord, FlowRunStatus, IntegrationExecutionRecord, LabelParticipationRecord,
    NodeRunStatus, ScriptExecutionRecord,
};
pub use store::{safe_json_string, safe_serialize, truncate_chars, HistoryStore};
