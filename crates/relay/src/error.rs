//! Relay error types.

use thiserror::Error;

/// Per-connection failure. All of these end the session; none of them end
/// the service.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The peer broke the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] broker::DecodeError),

    /// The WebSocket transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),

    /// The outbound channel closed underneath a writer.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
