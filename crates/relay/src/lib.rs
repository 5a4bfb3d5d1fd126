//! WebSocket relay service for a broker node.
//!
//! Accepts WebSocket connections, binds each one to a fresh edge on the
//! node, and pumps the text wire protocol in both directions:
//!
//! ```text
//! peer ──frames──► decoder ──ops──► edge ─┐
//!                                         │  node fan-out
//! peer ◄──MSG/INFO/PING─── encoder ◄──────┘
//! ```
//!
//! Each connection runs three cooperating tasks: a forwarder that owns the
//! socket sink, a writer that drains the edge's deliveries, and the main
//! loop combining the reader with liveness probing.

pub mod error;
pub mod ws_server;

pub use error::{RelayError, Result};
pub use ws_server::{create_router, AppState};
