/// HTTP API layer
///
/// The ingest boundary is the only public surface of this service; it
/// receives provider webhooks and hands matched events to the flow engine.

pub mod ingest;

use crate::engine::FlowEngine;
use crate::flow::presence::DevicePresence;
use crate::flow::store::EntityStore;
use crate::history::store::HistoryStore;
use std::sync::Arc;

/// Shared application state for the API handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EntityStore>,
    pub history: Arc<HistoryStore>,
    pub engine: Arc<FlowEngine>,
    pub presence: Arc<DevicePresence>,
    /// Shared ingest API key from configuration
    pub api_key: String,
}
