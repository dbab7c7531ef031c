//! Error taxonomy for the work-order engine.
//!
//! Every variant maps to one of the error kinds a caller is expected to
//! render into the `{code, msg, data}` HTTP envelope. Variants carry enough
//! context to build a useful message without the caller re-querying state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("user {user_id} is not authorized to {action} work order {work_order_id}")]
    Unauthorized {
        user_id: i64,
        work_order_id: i64,
        action: &'static str,
    },

    #[error("work order {0} has no active position matching the requested node")]
    StateNotActive(i64),

    #[error("work order {0} is already closed")]
    AlreadyClosed(i64),

    #[error("process graph is malformed: {0}")]
    GraphMalformed(String),

    #[error("no outgoing edge's condition matched for node {node_id} on work order {work_order_id}")]
    NoMatchingRoute { work_order_id: i64, node_id: String },

    #[error("assignee is required for node {node_id} but none was resolved")]
    AssigneeEmpty { node_id: String },

    #[error("rate limited: try again in {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("external call failed: {0}")]
    ExternalFailure(String),
}

impl EngineError {
    /// Stable string code used in the `{code, msg, data}` response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BadInput(_) => "BAD_INPUT",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Unauthorized { .. } => "UNAUTHORIZED",
            EngineError::StateNotActive(_) => "STATE_NOT_ACTIVE",
            EngineError::AlreadyClosed(_) => "ALREADY_CLOSED",
            EngineError::GraphMalformed(_) => "GRAPH_MALFORMED",
            EngineError::NoMatchingRoute { .. } => "NO_MATCHING_ROUTE",
            EngineError::AssigneeEmpty { .. } => "ASSIGNEE_EMPTY",
            EngineError::RateLimited { .. } => "RATE_LIMITED",
            EngineError::PersistenceFailure(_) => "PERSISTENCE_FAILURE",
            EngineError::ExternalFailure(_) => "EXTERNAL_FAILURE",
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::PersistenceFailure(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
