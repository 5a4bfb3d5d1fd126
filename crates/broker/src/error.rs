//! Broker error types.

use thiserror::Error;

/// Terminal cause reported by [`Edge::err`](crate::Edge::err) once
/// [`Edge::recv`](crate::Edge::recv) has returned `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The edge was torn down with [`Edge::close`](crate::Edge::close).
    #[error("edge is closed")]
    EdgeClosed,

    /// The owning node shut down while the edge was still attached.
    #[error("node shut down")]
    Cancelled,
}
