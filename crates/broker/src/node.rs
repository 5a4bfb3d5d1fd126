//! The routing graph: a node, its local edges, and the optional gateway.
//!
//! Fan-out offers each message to every local edge except its source, then
//! forwards it upstream unless it came from upstream or carries a
//! node-local (dot-prefixed) subject. The node keeps exactly one upstream
//! subscription per subject by reference-counting local subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::edge::{Edge, Pipe, EDGE_QUEUE_CAPACITY};
use crate::error::BrokerError;
use crate::protocol::Message;
use crate::InfoMap;

/// Where a message entered the node. Fan-out never echoes a message back
/// through its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local(Uuid),
    Gateway,
}

/// Builder for [`Node`]. Obtained from [`Node::builder`].
pub struct NodeBuilder {
    info: InfoMap,
    allow_local_dot_subjects: bool,
    gateway: Option<Arc<dyn Edge>>,
    queue_capacity: usize,
}

impl NodeBuilder {
    /// Permit subjects beginning with `.` to circulate among local edges.
    /// Such subjects are never forwarded to the gateway either way.
    pub fn allow_local_dot_subjects(mut self, allow: bool) -> Self {
        self.allow_local_dot_subjects = allow;
        self
    }

    /// Install the single upstream edge bridging this node to the wider
    /// topology. Another node's freshly created edge works here, which is
    /// how two in-process nodes are bridged.
    pub fn gateway(mut self, gateway: Arc<dyn Edge>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Capacity of the per-edge publish and deliver queues. Defaults to
    /// [`EDGE_QUEUE_CAPACITY`]. Must be non-zero.
    pub fn edge_queue_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "edge queue capacity must be non-zero");
        self.queue_capacity = capacity;
        self
    }

    /// Build the node. Requires a running Tokio runtime: the gateway intake
    /// pump (when a gateway is installed) is spawned here.
    pub fn build(self) -> Node {
        let shared = Arc::new(NodeShared {
            info: self.info,
            pipes: Mutex::new(Vec::new()),
            allow_local_dot_subjects: self.allow_local_dot_subjects,
            gateway: self.gateway,
            gateway_subjects: Mutex::new(HashMap::new()),
            queue_capacity: self.queue_capacity,
            shutdown: CancellationToken::new(),
        });
        if let Some(gateway) = shared.gateway.clone() {
            let node = Arc::clone(&shared);
            tokio::spawn(async move {
                node.run_gateway_intake(gateway).await;
            });
        }
        Node { shared }
    }
}

/// One broker vertex. Cheap to clone; clones share the same graph.
///
/// ```
/// use broker::{InfoMap, Node};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let node = Node::builder(InfoMap::new()).build();
///     let a = node.new_edge();
///     let b = node.new_edge();
///     b.subscribe("orders");
///     a.publish("orders", b"hello").await;
///     let msg = b.recv().await.expect("delivery");
///     assert_eq!(&msg.payload[..], b"hello");
/// });
/// ```
#[derive(Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
}

impl Node {
    pub fn builder(info: InfoMap) -> NodeBuilder {
        NodeBuilder {
            info,
            allow_local_dot_subjects: false,
            gateway: None,
            queue_capacity: EDGE_QUEUE_CAPACITY,
        }
    }

    /// Metadata published to each new edge.
    pub fn info(&self) -> &InfoMap {
        &self.shared.info
    }

    /// Number of currently attached local edges.
    pub fn edge_count(&self) -> usize {
        self.shared.pipes.lock().expect("edges lock").len()
    }

    /// Create, register and return a new local edge, spawning its publish
    /// pump. Requires a running Tokio runtime.
    pub fn new_edge(&self) -> Arc<dyn Edge> {
        let (pipe, pub_rx) = Pipe::new(
            self.shared.info.clone(),
            Arc::downgrade(&self.shared),
            self.shared.queue_capacity,
        );
        self.shared
            .pipes
            .lock()
            .expect("edges lock")
            .push(Arc::clone(&pipe));
        gauge!("broker_edges").increment(1.0);
        debug!(edge = %pipe.id(), "edge attached");

        let shared = Arc::clone(&self.shared);
        let pump_pipe = Arc::clone(&pipe);
        tokio::spawn(async move {
            shared.run_publish_pump(pump_pipe, pub_rx).await;
        });
        pipe
    }

    /// Shut the node down: every local edge terminates with
    /// [`BrokerError::Cancelled`] and the pumps exit. The gateway edge
    /// itself is left to its owner.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
        let pipes: Vec<Arc<Pipe>> = self.shared.pipes.lock().expect("edges lock").clone();
        for pipe in pipes {
            pipe.close_with(BrokerError::Cancelled);
        }
    }
}

pub(crate) struct NodeShared {
    info: InfoMap,
    pipes: Mutex<Vec<Arc<Pipe>>>,
    allow_local_dot_subjects: bool,
    gateway: Option<Arc<dyn Edge>>,
    // Subject -> number of local edges subscribed to it. A subject is
    // absent iff its count is zero.
    gateway_subjects: Mutex<HashMap<String, usize>>,
    queue_capacity: usize,
    shutdown: CancellationToken,
}

impl NodeShared {
    /// Reads one edge's publish queue and fans each message out. Exits on
    /// edge close or node shutdown, then detaches the edge.
    async fn run_publish_pump(self: Arc<Self>, pipe: Arc<Pipe>, mut pub_rx: mpsc::Receiver<Message>) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = pipe.closed().cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                msg = pub_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.fan_out(msg, Origin::Local(pipe.id())).await;
        }
        self.remove_pipe(&pipe);
    }

    /// Reads the gateway edge and fans each upstream message out locally.
    /// A gateway failure stops this pump only; local edges keep working.
    async fn run_gateway_intake(self: Arc<Self>, gateway: Arc<dyn Edge>) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                msg = gateway.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.fan_out(msg, Origin::Gateway).await;
        }
        if let Some(err) = gateway.err() {
            warn!(%err, "gateway intake stopped");
        }
    }

    async fn fan_out(&self, msg: Message, origin: Origin) {
        let is_dot_subject = msg.subject.starts_with('.');
        if is_dot_subject && !self.allow_local_dot_subjects {
            counter!("broker_messages_dropped_total").increment(1);
            return;
        }

        // Snapshot under the lock; deliveries may block on a full queue
        // and must not run while the edge list is held.
        let targets: Vec<Arc<Pipe>> = {
            let pipes = self.pipes.lock().expect("edges lock");
            pipes
                .iter()
                .filter(|pipe| Origin::Local(pipe.id()) != origin)
                .cloned()
                .collect()
        };
        for pipe in targets {
            pipe.deliver(&msg).await;
        }
        counter!("broker_messages_routed_total").increment(1);

        // Dot subjects are node-local.
        if is_dot_subject {
            return;
        }
        if let Some(gateway) = &self.gateway {
            if origin != Origin::Gateway {
                gateway.publish(&msg.subject, &msg.payload).await;
                counter!("broker_gateway_publishes_total").increment(1);
            }
        }
    }

    fn remove_pipe(&self, pipe: &Arc<Pipe>) {
        let mut pipes = self.pipes.lock().expect("edges lock");
        if let Some(index) = pipes.iter().position(|p| p.id() == pipe.id()) {
            pipes.swap_remove(index);
            gauge!("broker_edges").decrement(1.0);
            debug!(edge = %pipe.id(), "edge detached");
        }
    }

    /// Record one more local subscriber for `subject`; the 0→1 transition
    /// takes out the upstream subscription. Called outside any other lock.
    pub(crate) fn gateway_sub(&self, subject: &str) {
        let Some(gateway) = &self.gateway else { return };
        let newly_held = {
            let mut counts = self.gateway_subjects.lock().expect("gateway subjects lock");
            let count = counts.entry(subject.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if newly_held {
            gateway.subscribe(subject);
            debug!(subject, "gateway subscription added");
        }
    }

    /// Record one fewer local subscriber for `subject`; the 1→0 transition
    /// releases the upstream subscription. A decrement for an untracked
    /// subject is a no-op, so the count never goes negative.
    pub(crate) fn gateway_unsub(&self, subject: &str) {
        let Some(gateway) = &self.gateway else { return };
        let released = {
            let mut counts = self.gateway_subjects.lock().expect("gateway subjects lock");
            match counts.get_mut(subject) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    counts.remove(subject);
                    true
                }
                None => false,
            }
        };
        if released {
            gateway.unsubscribe(subject);
            debug!(subject, "gateway subscription released");
        }
    }
}
