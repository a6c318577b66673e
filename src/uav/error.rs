//! Error types for the UAV link and adapter layers.

use thiserror::Error;

/// Errors surfaced by a [`FlightLink`](super::FlightLink) implementation.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Transport could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The autopilot rejected a command.
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// A command was issued before the link was opened.
    #[error("link not connected")]
    NotConnected,
}

/// Errors surfaced by the [`UavClient`](super::client::UavClient) adapter.
#[derive(Debug, Error)]
pub enum UavError {
    #[error(transparent)]
    Link(#[from] LinkError),

    /// A bounded wait on telemetry expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Both takeoff attempts and the guided-climb fallback failed.
    #[error("takeoff did not reach target altitude")]
    TakeoffFailed,

    /// An operation needed a position fix that is not available yet.
    #[error("no position available")]
    NoPosition,
}
