//! Scheduler error types.

use gridsim_core::CoreError;
use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("a node named '{0}' already exists")]
    DuplicateName(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("transition rejected: {0}")]
    TransitionRejected(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
