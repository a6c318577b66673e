//! Error types for session registration and lifecycle.

use thiserror::Error;

use crate::drone_id::DroneId;
use crate::uav::error::UavError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// A second session was registered for a drone that already has one.
    #[error("drone {drone_id} already has an active session")]
    AlreadyRegistered { drone_id: DroneId },

    /// Lookup or removal targeted a drone with no registered session.
    #[error("no session registered for drone {drone_id}")]
    NotRegistered { drone_id: DroneId },

    /// The adapter could not be brought up (or back up); the drone keeps its
    /// registry entry but is marked failed in the store.
    #[error("session for drone {drone_id} failed to start: {source}")]
    StartFailed {
        drone_id: DroneId,
        source: UavError,
    },
}
