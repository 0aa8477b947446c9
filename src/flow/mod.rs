/// Flow management layer
///
/// Entity model for flows, nodes, and edges, the SQLite-backed entity store,
/// the petgraph structural view, and the ingest-side presence tracker.

pub mod graph;
pub mod presence;
pub mod store;
pub mod types;

pub use graph::FlowGraph;
pub use presence::DevicePresence;
pub use store::EntityStore;
pub use types::{attr_text, Device, Edge, Flow, FlowNode, Function, Integration, NodeKind};
