/// Fieldflow: telemetry ingestion and flow automation engine
///
/// Ingests uplink events from field devices and routes each event through
/// user-authored flows: Lua transform nodes, HTTP and MQTT sink nodes, with
/// a full execution audit trail in SQLite.

// Core configuration and setup
pub mod config;

// Flow management layer - entity model, store, structural view, presence
pub mod flow;

// Execution engine - trigger resolution, graph traversal, node executors
pub mod engine;

// Execution history layer - audit records and their store
pub mod history;

// HTTP API layer - the ingest boundary
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use config::Config;
pub use engine::{FlowEngine, FlowExecutionSummary, NodeResult, NodeStatus};
pub use flow::{Device, Edge, EntityStore, Flow, FlowNode, Integration, NodeKind};
pub use history::{FlowRunStatus, HistoryStore};
pub use server::start_server;
