//! Error types for the C2 gateway.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum C2Error {
    /// The configured URL could not be turned into an endpoint.
    #[error("invalid C2 endpoint: {0}")]
    InvalidEndpoint(String),

    /// Credentials contained bytes that cannot travel in gRPC metadata.
    #[error("invalid credential encoding")]
    InvalidCredentials,

    /// Transport-level failure (connect, TLS, DNS).
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The long poll completed without a request; normal, the caller loops.
    #[error("listen poll timed out")]
    ListenTimeout,

    /// The server rejected or failed an RPC.
    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
}

impl C2Error {
    /// True for errors the caller should absorb by retrying on its next
    /// period rather than escalating.
    pub fn is_transient(&self) -> bool {
        matches!(self, C2Error::ListenTimeout | C2Error::Rpc(_) | C2Error::Transport(_))
    }
}
