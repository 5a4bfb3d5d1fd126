//! In-process publish/subscribe broker.
//!
//! A [`Node`] is one vertex in a message topology. Local subscribers attach
//! as edges; an optional gateway edge bridges the node to the wider graph.
//! A message published on any edge is delivered to every other edge whose
//! subscription set contains the subject.
//!
//! ## Architecture
//!
//! ```text
//! peer bytes ──► Decoder ──► edge publish queue
//!                                  │
//!                            Node fan-out
//!                          ┌───────┴────────┐
//!                          ▼                ▼
//!                  other edges'         gateway edge
//!                  deliver queues    (non-dot subjects)
//!                          │
//!                          ▼
//!                  encode_msg ──► peer bytes
//! ```
//!
//! ## Design notes
//!
//! - Both per-edge queues are bounded (capacity 8 by default): a stalled
//!   consumer exerts backpressure on the publisher instead of growing
//!   memory without limit.
//! - The node holds exactly one upstream subscription per subject, for as
//!   long as at least one local edge is subscribed to it.
//! - Subjects beginning with `.` never leave the node.

pub mod edge;
pub mod error;
pub mod node;
pub mod protocol;

pub use edge::{Edge, Pipe, EDGE_QUEUE_CAPACITY};
pub use error::BrokerError;
pub use node::{Node, NodeBuilder};
pub use protocol::{ClientOp, DecodeError, Decoder, Message};

/// Session metadata published to each peer as the body of the `INFO` frame.
pub type InfoMap = serde_json::Map<String, serde_json::Value>;
