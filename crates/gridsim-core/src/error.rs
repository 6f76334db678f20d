//! Error types for the node task-lifecycle engine.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by tasks and nodes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("task already running: {0}")]
    AlreadyRunning(String),

    #[error("node {node} is not active (state: {state})")]
    NodeNotActive { node: String, state: String },

    #[error("insufficient capacity on node {node}: {requested} cores requested, {available} available")]
    InsufficientCapacity {
        node: String,
        requested: u32,
        available: u32,
    },
}
