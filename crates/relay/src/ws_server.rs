//! WebSocket server and per-connection pumps.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use broker::{protocol, ClientOp, Decoder, Edge, Node};
use bytes::BytesMut;
use futures::{stream::SplitStream, SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// Liveness probes left unanswered before the peer is declared gone.
const MAX_OUTSTANDING_PINGS: u32 = 2;

/// Shared application state.
pub struct AppState {
    pub node: Node,
    /// Interval between liveness probes on an otherwise silent peer.
    pub ping_interval: Duration,
}

/// Create the HTTP router exposing `/ws` and `/health`.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(r#"{{"status":"ok","edges":{}}}"#, state.node.edge_count())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Serve one WebSocket connection bound to one fresh edge.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // All frame producers go through one channel; the forwarder below is
    // the only task touching the sink.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let edge = state.node.new_edge();
    counter!("relay_connections_total").increment(1);
    gauge!("relay_active_connections").increment(1.0);
    info!("peer connected");

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    let writer_edge = Arc::clone(&edge);
    let writer_tx = out_tx.clone();
    let writer_task = tokio::spawn(async move {
        if let Err(err) = write_deliveries(writer_edge, writer_tx).await {
            debug!(%err, "delivery writer stopped");
        }
    });

    if let Err(err) = read_loop(&state, &edge, &mut ws_rx, &out_tx).await {
        warn!(%err, "session ended");
    }

    edge.close();
    writer_task.abort();
    // Dropping the last sender lets the forwarder drain pending frames
    // (an -ERR or close frame, typically) and exit.
    drop(out_tx);
    let _ = forward_task.await;

    gauge!("relay_active_connections").decrement(1.0);
    info!("peer disconnected");
}

/// Emit the `INFO` frame, then stream `MSG` frames until the edge
/// terminates.
async fn write_deliveries(
    edge: Arc<dyn Edge>,
    out_tx: mpsc::UnboundedSender<Message>,
) -> Result<()> {
    let mut buf = BytesMut::new();
    protocol::encode_info(&mut buf, edge.info());
    out_tx
        .send(Message::Binary(buf.split().freeze()))
        .map_err(|_| RelayError::ConnectionClosed)?;

    while let Some(msg) = edge.recv().await {
        counter!("relay_messages_sent_total").increment(1);
        protocol::encode_msg(&mut buf, &msg);
        out_tx
            .send(Message::Binary(buf.split().freeze()))
            .map_err(|_| RelayError::ConnectionClosed)?;
    }
    if let Some(err) = edge.err() {
        debug!(%err, "edge terminated");
    }
    Ok(())
}

/// Reader plus liveness, combined in one select loop. Returns when the
/// peer disconnects, breaks the protocol, or stops responding to pings.
async fn read_loop(
    state: &AppState,
    edge: &Arc<dyn Edge>,
    ws_rx: &mut SplitStream<WebSocket>,
    out_tx: &mpsc::UnboundedSender<Message>,
) -> Result<()> {
    let mut decoder = Decoder::new();
    let mut ops = Vec::new();
    let mut outstanding: u32 = 0;

    let mut ping = interval(state.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a fresh interval fires immediately; push it out a
    // full period so a new peer isn't probed on arrival.
    ping.reset();

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                let Some(msg) = msg else {
                    return Ok(());
                };
                let msg = msg?;
                outstanding = 0;
                ping.reset();
                match msg {
                    Message::Binary(data) => {
                        apply_frame(edge, &mut decoder, &data, &mut ops, out_tx).await?;
                    }
                    Message::Text(text) => {
                        apply_frame(edge, &mut decoder, text.as_bytes(), &mut ops, out_tx).await?;
                    }
                    Message::Ping(data) => {
                        out_tx
                            .send(Message::Pong(data))
                            .map_err(|_| RelayError::ConnectionClosed)?;
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => return Ok(()),
                }
            }

            _ = ping.tick() => {
                if outstanding >= MAX_OUTSTANDING_PINGS {
                    let elapsed = state.ping_interval * (MAX_OUTSTANDING_PINGS + 1);
                    counter!("relay_liveness_timeouts_total").increment(1);
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: format!("no response for {elapsed:?}").into(),
                    };
                    let _ = out_tx.send(Message::Close(Some(frame)));
                    return Ok(());
                }
                let mut buf = BytesMut::new();
                protocol::encode_ping(&mut buf);
                out_tx
                    .send(Message::Binary(buf.freeze()))
                    .map_err(|_| RelayError::ConnectionClosed)?;
                outstanding += 1;
            }
        }
    }
}

/// Decode one inbound frame and apply its operations to the edge.
///
/// Operations completed before a malformed byte are applied, then the peer
/// gets an `-ERR` frame and the error ends the session.
async fn apply_frame(
    edge: &Arc<dyn Edge>,
    decoder: &mut Decoder,
    data: &[u8],
    ops: &mut Vec<ClientOp>,
    out_tx: &mpsc::UnboundedSender<Message>,
) -> Result<()> {
    let decoded = decoder.feed(data, ops);

    for op in ops.drain(..) {
        match op {
            ClientOp::Publish { subject, payload } => {
                counter!("relay_publishes_total").increment(1);
                edge.publish(&subject, &payload).await;
            }
            ClientOp::Subscribe { subject } => {
                debug!(subject, "subscribe");
                edge.subscribe(&subject);
            }
            ClientOp::Unsubscribe { subject } => {
                debug!(subject, "unsubscribe");
                edge.unsubscribe(&subject);
            }
            ClientOp::Ping => {
                let mut buf = BytesMut::new();
                protocol::encode_pong(&mut buf);
                out_tx
                    .send(Message::Binary(buf.freeze()))
                    .map_err(|_| RelayError::ConnectionClosed)?;
            }
            ClientOp::Pong => {}
        }
    }

    if let Err(err) = decoded {
        counter!("relay_protocol_errors_total").increment(1);
        let mut buf = BytesMut::new();
        protocol::encode_err(&mut buf, &err);
        let _ = out_tx.send(Message::Binary(buf.freeze()));
        return Err(err.into());
    }
    Ok(())
}
