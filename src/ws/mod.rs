//! Websocket topology publisher
//!
//! Serves `/ws`. A fresh client receives a `SyncReply` snapshot of the whole
//! graph, then every subsequent mutation as an individual event message, in
//! application order. Snapshot serialization and listener registration
//! happen inside one graph critical section so no event between the two is
//! lost. Liveness is ping-driven: a ping every half pong-timeout, close on a
//! missed pong. Slow clients are disconnected once their outbound queue
//! hits the high-water mark rather than back-pressuring mutators.

use crate::graph::{Edge, Graph, GraphEvent, GraphEventListener, Node};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use uuid::Uuid;

/// Outbound messages buffered per client before the connection is dropped.
const CLIENT_QUEUE_HIGH_WATER: usize = 1000;

const GRAPH_NAMESPACE: &str = "Graph";

/// Newline-free JSON envelope carried over the websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Obj")]
    pub obj: serde_json::Value,
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "Status")]
    pub status: i64,
}

impl WsEnvelope {
    pub fn new(namespace: &str, kind: &str, obj: serde_json::Value) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            obj,
            uuid: Uuid::new_v4().to_string(),
            status: 200,
        }
    }
}

struct PublisherState {
    graph: Arc<Graph>,
    host: String,
    pong_timeout: Duration,
    next_client_id: AtomicU64,
    clients: DashMap<u64, ()>,
}

/// Graph listener forwarding events to one client's outbound queue.
/// Invoked under the graph write lock, so it must never block: a full queue
/// marks the client overflowed and the connection task tears it down.
struct ClientListener {
    tx: mpsc::Sender<WsEnvelope>,
    host: String,
    overflowed: Arc<AtomicBool>,
}

impl GraphEventListener for ClientListener {
    fn on_event(&self, event: &GraphEvent) {
        if self.overflowed.load(Ordering::Relaxed) {
            return;
        }
        let envelope = envelope_for_event(event, &self.host);
        if self.tx.try_send(envelope).is_err() {
            self.overflowed.store(true, Ordering::Relaxed);
        }
    }
}

fn stamp_node(mut node: Node, host: &str) -> Node {
    node.host = Some(host.to_string());
    node
}

fn stamp_edge(mut edge: Edge, host: &str) -> Edge {
    edge.host = Some(host.to_string());
    edge
}

fn envelope_for_event(event: &GraphEvent, host: &str) -> WsEnvelope {
    let obj = match event {
        GraphEvent::NodeAdded(n) | GraphEvent::NodeUpdated(n) | GraphEvent::NodeDeleted(n) => {
            serde_json::to_value(stamp_node(n.clone(), host)).unwrap_or_default()
        }
        GraphEvent::EdgeAdded(e) | GraphEvent::EdgeUpdated(e) | GraphEvent::EdgeDeleted(e) => {
            serde_json::to_value(stamp_edge(e.clone(), host)).unwrap_or_default()
        }
    };
    WsEnvelope::new(GRAPH_NAMESPACE, event.kind(), obj)
}

/// Serve the websocket endpoint until the process exits.
pub async fn serve(graph: Arc<Graph>, host: String, listen: u16, pong_timeout: Duration) -> anyhow::Result<()> {
    let state = Arc::new(PublisherState {
        graph,
        host,
        pong_timeout,
        next_client_id: AtomicU64::new(0),
        clients: DashMap::new(),
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", listen);
    info!("Topology publisher listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<PublisherState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

async fn handle_client(socket: WebSocket, state: Arc<PublisherState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    state.clients.insert(client_id, ());
    info!(
        "Topology subscriber {} connected ({} active)",
        client_id,
        state.clients.len()
    );

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsEnvelope>(CLIENT_QUEUE_HIGH_WATER);
    let overflowed = Arc::new(AtomicBool::new(false));

    // Snapshot and subscription must be atomic: the write lock spans both,
    // so every mutation after the snapshot reaches the queue.
    let (snapshot, listener_id) = {
        let mut g = state.graph.write();
        let snapshot = sync_reply(g.nodes(), g.edges(), &state.host);
        let listener_id = g.add_listener(Arc::new(ClientListener {
            tx,
            host: state.host.clone(),
            overflowed: overflowed.clone(),
        }));
        (snapshot, listener_id)
    };

    let disconnect_reason = client_loop(
        &mut sender,
        &mut receiver,
        &mut rx,
        snapshot,
        state.pong_timeout,
        &overflowed,
    )
    .await;

    state.graph.write().remove_listener(listener_id);
    state.clients.remove(&client_id);
    info!(
        "Topology subscriber {} disconnected: {}",
        client_id, disconnect_reason
    );
}

async fn client_loop(
    sender: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    receiver: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
    rx: &mut mpsc::Receiver<WsEnvelope>,
    snapshot: WsEnvelope,
    pong_timeout: Duration,
    overflowed: &AtomicBool,
) -> &'static str {
    match serde_json::to_string(&snapshot) {
        Ok(payload) => {
            if sender.send(Message::Text(payload)).await.is_err() {
                return "snapshot send failed";
            }
        }
        Err(e) => {
            warn!("Failed to serialize snapshot: {}", e);
            return "snapshot serialization failed";
        }
    }

    // The first tick fires immediately; that initial ping doubles as the
    // readiness signal for test clients.
    let mut ping_interval = interval(pong_timeout / 2);
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if overflowed.load(Ordering::Relaxed) {
                    return "outbound queue overflow";
                }
                if last_pong.elapsed() > pong_timeout {
                    return "pong timeout";
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    return "ping send failed";
                }
            }

            envelope = rx.recv() => {
                let Some(envelope) = envelope else {
                    return "event queue closed";
                };
                match serde_json::to_string(&envelope) {
                    Ok(payload) => {
                        if sender.send(Message::Text(payload)).await.is_err() {
                            return "event send failed";
                        }
                    }
                    Err(e) => warn!("Failed to serialize event: {}", e),
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => last_pong = tokio::time::Instant::now(),
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            return "pong send failed";
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return "closed by client",
                    Some(Ok(other)) => debug!("Ignoring client message: {:?}", other),
                    Some(Err(_)) => return "receive error",
                }
            }
        }
    }
}

fn sync_reply(nodes: Vec<Node>, edges: Vec<Edge>, host: &str) -> WsEnvelope {
    let nodes: Vec<Node> = nodes.into_iter().map(|n| stamp_node(n, host)).collect();
    let edges: Vec<Edge> = edges.into_iter().map(|e| stamp_edge(e, host)).collect();
    WsEnvelope::new(
        GRAPH_NAMESPACE,
        "SyncReply",
        json!({"Nodes": nodes, "Edges": edges}),
    )
}
