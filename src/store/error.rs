//! Error types for the state store.

use crate::drone_id::DroneId;

/// The drone is not registered in the store.
#[derive(Debug, thiserror::Error)]
#[error("drone {drone_id} is not registered")]
pub struct UnknownDrone {
    pub drone_id: DroneId,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    UnknownDrone(#[from] UnknownDrone),

    /// Progress must be non-decreasing while the same task is executing.
    #[error("task {task_id} progress regression: {from:.3} -> {to:.3}")]
    ProgressRegression {
        task_id: String,
        from: f64,
        to: f64,
    },

    /// A task facet update violated the phase/task-id pairing rule.
    #[error("invalid task facet: {0}")]
    InvalidTaskFacet(&'static str),
}
