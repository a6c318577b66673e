//! Error types for agent request handling.

use thiserror::Error;

/// Why an execute request was rejected before an executor was spawned.
#[derive(Debug, Error)]
pub enum RejectReason {
    #[error("missing task_id")]
    MissingTaskId,

    #[error("missing assignee entity_id")]
    MissingAssignee,

    #[error("drone {0} is not managed by this process")]
    UnknownDrone(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] crate::tasks::error::ValidationError),
}
