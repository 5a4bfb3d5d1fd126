//! Subscriber edges.
//!
//! [`Edge`] is the capability set the node routes through; [`Pipe`] is the
//! node-constructed realization backing one attached peer. The gateway slot
//! accepts any other realization — the node never downcasts, it only
//! compares identities.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::node::NodeShared;
use crate::protocol::Message;
use crate::InfoMap;

/// Default capacity of the per-edge publish and deliver queues.
///
/// Bounded on purpose: a stalled consumer shows up as fan-out backpressure,
/// not as unbounded memory growth.
pub const EDGE_QUEUE_CAPACITY: usize = 8;

/// One subscriber endpoint on a node.
#[async_trait]
pub trait Edge: Send + Sync {
    /// Immutable session metadata, sent to the peer once as an `INFO` frame.
    fn info(&self) -> &InfoMap;

    /// Queue a publish produced by this edge. Blocks while the publish
    /// queue is full; drops without blocking once the edge is closed. The
    /// payload is copied, so the caller keeps ownership of its buffer.
    async fn publish(&self, subject: &str, payload: &[u8]);

    /// Add `subject` to the subscription set.
    fn subscribe(&self, subject: &str);

    /// Remove `subject` from the subscription set.
    fn unsubscribe(&self, subject: &str);

    /// Wait for the next delivery. Returns `None` once the edge has
    /// terminated; [`Edge::err`] then reports the cause. Cancel-safe.
    async fn recv(&self) -> Option<Message>;

    /// Terminal cause, set at most once, readable after [`Edge::recv`]
    /// returns `None`.
    fn err(&self) -> Option<BrokerError>;

    /// Tear the edge down: unsubscribe everything, wake all blocked
    /// callers. Idempotent.
    fn close(&self);
}

/// The locally constructed edge realization.
pub struct Pipe {
    id: Uuid,
    info: InfoMap,
    subjects: DashSet<String>,
    pub_tx: mpsc::Sender<Message>,
    deliver_tx: mpsc::Sender<Message>,
    deliver_rx: AsyncMutex<mpsc::Receiver<Message>>,
    closed: CancellationToken,
    err: OnceLock<BrokerError>,
    node: Weak<NodeShared>,
}

impl Pipe {
    /// Returns the pipe plus the receiving half of its publish queue, which
    /// the node moves into this pipe's fan-out pump.
    pub(crate) fn new(
        info: InfoMap,
        node: Weak<NodeShared>,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (pub_tx, pub_rx) = mpsc::channel(queue_capacity);
        let (deliver_tx, deliver_rx) = mpsc::channel(queue_capacity);
        let pipe = Arc::new(Self {
            id: Uuid::new_v4(),
            info,
            subjects: DashSet::new(),
            pub_tx,
            deliver_tx,
            deliver_rx: AsyncMutex::new(deliver_rx),
            closed: CancellationToken::new(),
            err: OnceLock::new(),
            node,
        });
        (pipe, pub_rx)
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Offer a message to this pipe. Dropped unless the subject is in the
    /// subscription set; blocks on a full deliver queue until space frees
    /// up or the pipe closes.
    pub(crate) async fn deliver(&self, msg: &Message) {
        if !self.subjects.contains(msg.subject.as_str()) {
            return;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {}
            result = self.deliver_tx.send(msg.clone()) => {
                let _ = result;
            }
        }
    }

    /// Close with an explicit terminal cause. The first cause wins.
    pub(crate) fn close_with(&self, cause: BrokerError) {
        let _ = self.err.set(cause);
        // Release gateway refcounts for every subject still held. Racing
        // closers each see a subject removed at most once.
        let held: Vec<String> = self.subjects.iter().map(|s| s.clone()).collect();
        for subject in held {
            if self.subjects.remove(&subject).is_some() {
                if let Some(node) = self.node.upgrade() {
                    node.gateway_unsub(&subject);
                }
            }
        }
        self.closed.cancel();
    }
}

#[async_trait]
impl Edge for Pipe {
    fn info(&self) -> &InfoMap {
        &self.info
    }

    async fn publish(&self, subject: &str, payload: &[u8]) {
        let msg = Message {
            subject: subject.to_string(),
            payload: Bytes::copy_from_slice(payload),
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {}
            result = self.pub_tx.send(msg) => {
                let _ = result;
            }
        }
    }

    fn subscribe(&self, subject: &str) {
        // A closed pipe has already drained its subjects and released its
        // gateway refcounts; a late subscribe must not resurrect either.
        if self.closed.is_cancelled() {
            return;
        }
        self.subjects.insert(subject.to_string());
        if let Some(node) = self.node.upgrade() {
            node.gateway_sub(subject);
        }
    }

    fn unsubscribe(&self, subject: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        self.subjects.remove(subject);
        if let Some(node) = self.node.upgrade() {
            node.gateway_unsub(subject);
        }
    }

    async fn recv(&self) -> Option<Message> {
        if self.err.get().is_some() {
            return None;
        }
        let mut rx = self.deliver_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                let _ = self.err.set(BrokerError::EdgeClosed);
                None
            }
            msg = rx.recv() => msg,
        }
    }

    fn err(&self) -> Option<BrokerError> {
        self.err.get().copied()
    }

    fn close(&self) {
        self.close_with(BrokerError::EdgeClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn pipe() -> (Arc<Pipe>, mpsc::Receiver<Message>) {
        Pipe::new(InfoMap::new(), Weak::new(), EDGE_QUEUE_CAPACITY)
    }

    fn msg(subject: &str, payload: &'static [u8]) -> Message {
        Message::new(subject, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn delivery_is_gated_on_the_subscription_set() {
        let (pipe, _pub_rx) = pipe();
        pipe.subscribe("foo");

        pipe.deliver(&msg("foo", b"yes")).await;
        pipe.deliver(&msg("bar", b"no")).await;

        let got = timeout(Duration::from_secs(1), pipe.recv())
            .await
            .expect("recv")
            .expect("message");
        assert_eq!(got, msg("foo", b"yes"));

        // The unsubscribed message was dropped, so nothing else arrives.
        assert!(timeout(Duration::from_millis(50), pipe.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn publish_lands_on_the_publish_queue() {
        let (pipe, mut pub_rx) = pipe();
        pipe.publish("foo", b"bar").await;
        assert_eq!(pub_rx.recv().await, Some(msg("foo", b"bar")));
    }

    #[tokio::test]
    async fn publish_after_close_never_blocks() {
        let (pipe, _pub_rx) = pipe();
        // Fill the bounded queue so a live publish would block.
        for _ in 0..EDGE_QUEUE_CAPACITY {
            pipe.publish("foo", b"x").await;
        }
        pipe.close();
        timeout(Duration::from_millis(100), pipe.publish("foo", b"dropped"))
            .await
            .expect("publish on a closed edge must return immediately");
    }

    #[tokio::test]
    async fn recv_reports_terminal_error_after_close() {
        let (pipe, _pub_rx) = pipe();
        pipe.close();
        assert_eq!(pipe.recv().await, None);
        assert_eq!(pipe.err(), Some(BrokerError::EdgeClosed));
        // Sticky.
        assert_eq!(pipe.recv().await, None);
        assert_eq!(pipe.err(), Some(BrokerError::EdgeClosed));
    }

    #[tokio::test]
    async fn close_wakes_a_blocked_recv() {
        let (pipe, _pub_rx) = pipe();
        let waiter = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move { pipe.recv().await })
        };
        tokio::task::yield_now().await;
        pipe.close();
        let got = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("recv must wake")
            .expect("join");
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn close_unblocks_a_stalled_delivery() {
        let (pipe, _pub_rx) = pipe();
        pipe.subscribe("foo");
        for _ in 0..EDGE_QUEUE_CAPACITY {
            pipe.deliver(&msg("foo", b"x")).await;
        }
        let stalled = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move { pipe.deliver(&msg("foo", b"overflow")).await })
        };
        tokio::task::yield_now().await;
        pipe.close();
        timeout(Duration::from_secs(1), stalled)
            .await
            .expect("delivery must unblock")
            .expect("join");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (pipe, _pub_rx) = pipe();
        pipe.subscribe("foo");
        pipe.close();
        pipe.close();
        assert_eq!(pipe.err(), Some(BrokerError::EdgeClosed));
    }

    #[tokio::test]
    async fn first_terminal_cause_wins() {
        let (pipe, _pub_rx) = pipe();
        pipe.close_with(BrokerError::Cancelled);
        pipe.close();
        assert_eq!(pipe.err(), Some(BrokerError::Cancelled));
    }

    #[tokio::test]
    async fn recv_blocks_until_a_delivery_arrives() {
        let (pipe, _pub_rx) = pipe();
        pipe.subscribe("foo");
        let reader = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move { pipe.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipe.deliver(&msg("foo", b"late")).await;
        let got = timeout(Duration::from_secs(1), reader)
            .await
            .expect("recv")
            .expect("join");
        assert_eq!(got, Some(msg("foo", b"late")));
    }

    #[tokio::test]
    async fn info_returns_the_session_metadata() {
        let mut info = InfoMap::new();
        info.insert("name".to_string(), serde_json::Value::String("e1".into()));
        let (pipe, _pub_rx) = Pipe::new(info.clone(), Weak::new(), EDGE_QUEUE_CAPACITY);
        assert_eq!(pipe.info(), &info);
    }
}
