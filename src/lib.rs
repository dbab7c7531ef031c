//! Process execution kernel for typed work-order graphs.
//!
//! Interprets user-defined process graphs (start/userTask/receiveTask/
//! exclusiveGateway/parallelGateway/end nodes, conditional edges) over
//! persistent work orders: resolving assignees, evaluating routing
//! conditions, advancing transactional state, and recording an append-only
//! circulation history.

pub mod authz;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod notify;
pub mod query;
pub mod resolver;
pub mod state;
pub mod store;
pub mod tasks;
pub mod token_cache;

pub use engine::{CreateWorkOrderRequest, Engine, HandleWorkOrderRequest};
pub use error::{EngineError, EngineResult};
pub use graph::{Graph, GraphEdge, GraphNode, NodeClass, Process};
pub use state::{ActiveState, CirculationHistory, TemplateData, WorkOrder};
pub use store::ProcessStore;
pub use tasks::{NoopTaskRunner, TaskRunner, TaskSubmission};
