//! Error types for task validation and execution.

use thiserror::Error;

use crate::uav::error::UavError;

/// Task parameters failed validation at the agent boundary.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: String,
    },

    #[error("undecodable task specification: {0}")]
    Undecodable(#[from] prost::DecodeError),
}

/// Why an executor finished without completing its task.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("pre-flight check failed: {0}")]
    PreFlight(String),

    #[error("flight command failed: {0}")]
    Command(#[from] UavError),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    InvalidParams(#[from] ValidationError),
}
