//! ConnectionServer (§4.6): the WebSocket transport. Owns every live socket,
//! the per-connection outbound queues, and the heartbeat loop. Everything
//! protocol-meaningful is delegated to [`crate::manager::SessionManager`] —
//! this module never touches a `Session` directly.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};

use crate::error::ErrorKind;
use crate::manager::{ManagerEvent, SessionManager};
use crate::protocol::{self, ClientMessage, DecodeOutcome, Role, ServerMessage, MAX_FRAME_BYTES};
use crate::rate_limit::RateLimiter;

/// Bounded per-connection outbound backlog. `TRANSACTION_RECEIVED` and
/// `TRANSACTION_EXECUTED` bypass the cap and are never dropped (§4.6) — every
/// other frame is best-effort and the oldest is evicted under pressure.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Grace period before closing a connection after a non-rate-limited AUTH
/// failure (§4.6), long enough for the queued `AUTH_FAILED`/`ERROR` frame
/// to actually reach the client before the socket goes away.
const AUTH_FAILURE_CLOSE_DELAY: Duration = Duration::from_millis(200);

fn is_undroppable(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::TransactionReceived { .. } | ServerMessage::TransactionExecuted { .. })
}

/// Whether a frame of `len` bytes trips the 5 MiB hard cap (§4.1). Exactly
/// `MAX_FRAME_BYTES` is accepted; one byte over is rejected and the
/// connection closed.
fn exceeds_frame_limit(len: usize) -> bool {
    len > MAX_FRAME_BYTES
}

struct OutboundQueue {
    messages: StdMutex<VecDeque<ServerMessage>>,
    notify: Notify,
}

impl OutboundQueue {
    fn new() -> Self {
        Self { messages: StdMutex::new(VecDeque::new()), notify: Notify::new() }
    }

    fn push(&self, message: ServerMessage) {
        let mut queue = self.messages.lock().expect("outbound queue poisoned");
        if !is_undroppable(&message) && queue.len() >= OUTBOUND_QUEUE_CAPACITY {
            queue.pop_front();
            metrics::counter!("ws_outbound_dropped_total").increment(1);
        }
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> ServerMessage {
        loop {
            if let Some(message) = self.messages.lock().expect("outbound queue poisoned").pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

type ConnectionKey = (String, u64);

#[derive(Default)]
struct Connections {
    queues: RwLock<HashMap<ConnectionKey, Arc<OutboundQueue>>>,
}

impl Connections {
    fn register(&self, key: ConnectionKey, queue: Arc<OutboundQueue>) {
        self.queues.write().expect("connections map poisoned").insert(key, queue);
    }

    fn remove(&self, key: &ConnectionKey) {
        self.queues.write().expect("connections map poisoned").remove(key);
    }

    fn unicast(&self, session_id: &str, participant_id: u64, message: ServerMessage) {
        let queues = self.queues.read().expect("connections map poisoned");
        if let Some(queue) = queues.get(&(session_id.to_string(), participant_id)) {
            queue.push(message);
        }
    }

    fn broadcast(&self, session_id: &str, message: ServerMessage) {
        let queues = self.queues.read().expect("connections map poisoned");
        for (key, queue) in queues.iter() {
            if key.0 == session_id {
                queue.push(message.clone());
            }
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
    connections: Arc<Connections>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl AppState {
    /// Build the shared state and spawn the task that drains `SessionManager`
    /// events into the right connection's outbound queue.
    pub fn new(manager: Arc<SessionManager>, events_rx: mpsc::UnboundedReceiver<ManagerEvent>, rate_limiter: Arc<RateLimiter>, heartbeat_interval: Duration, heartbeat_timeout: Duration) -> Self {
        let connections = Arc::new(Connections::default());
        spawn_event_loop(Arc::clone(&connections), events_rx);
        Self { manager, rate_limiter, connections, heartbeat_interval, heartbeat_timeout }
    }
}

fn spawn_event_loop(connections: Arc<Connections>, mut events_rx: mpsc::UnboundedReceiver<ManagerEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ManagerEvent::Unicast { session_id, participant_id, message } => connections.unicast(&session_id, participant_id, message),
                ManagerEvent::Broadcast { session_id, message } => connections.broadcast(&session_id, message),
                ManagerEvent::CloseConnection { session_id, participant_id } => connections.remove(&(session_id, participant_id)),
            }
        }
    });
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<SocketAddr>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

/// Authenticated identity of a connection, known only after `AUTH` succeeds.
struct Identity {
    session_id: String,
    participant_id: u64,
    role: Role,
}

async fn handle_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    metrics::counter!("ws_connections_total").increment(1);
    let (mut sink, mut stream) = socket.split();

    let queue = Arc::new(OutboundQueue::new());
    let close_signal = Arc::new(Notify::new());
    let mut identity: Option<Identity> = None;
    let mut last_pong = Instant::now();
    let mut heartbeat = tokio::time::interval(state.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            outbound = queue.pop() => {
                if sink.send(Message::Text(outbound.to_json())).await.is_err() {
                    break;
                }
            }
            _ = close_signal.notified() => {
                break;
            }
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > state.heartbeat_timeout {
                    tracing::warn!(peer = %peer, "heartbeat timeout, closing connection");
                    break;
                }
                queue.push(ServerMessage::Ping);
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(raw))) => {
                        if exceeds_frame_limit(raw.len()) {
                            // Oversized frame is dropped and the connection
                            // closed outright (§4.1, §4.6) — flush the
                            // ERROR frame directly rather than queuing it,
                            // since the loop exits before the next poll.
                            let _ = sink.send(Message::Text(ServerMessage::error(ErrorKind::Validation, "frame exceeds maximum size").to_json())).await;
                            break;
                        }
                        handle_frame(&raw, &state, &peer, &queue, &close_signal, &mut identity, &mut last_pong).await;
                    }
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    if let Some(identity) = identity.take() {
        state.connections.remove(&(identity.session_id.clone(), identity.participant_id));
        state.manager.handle_disconnect(&identity.session_id, identity.participant_id);
    }
    metrics::counter!("ws_disconnections_total").increment(1);
    tracing::info!(peer = %peer, "connection closed");
}

async fn handle_frame(
    raw: &str,
    state: &AppState,
    peer: &SocketAddr,
    queue: &Arc<OutboundQueue>,
    close_signal: &Arc<Notify>,
    identity: &mut Option<Identity>,
    last_pong: &mut Instant,
) {
    let decoded = protocol::decode_client_message(raw);
    let message = match decoded {
        DecodeOutcome::Message(m) => m,
        DecodeOutcome::Reject(reason) => {
            queue.push(ServerMessage::error(ErrorKind::Validation, reason));
            return;
        }
        DecodeOutcome::UnknownType(kind) => {
            queue.push(ServerMessage::error(ErrorKind::Validation, format!("unknown message type `{kind}`")));
            return;
        }
    };

    match (identity.as_ref(), message) {
        (None, ClientMessage::Auth { session_id, auth_token, role, label, public_key }) => {
            let peer_key = peer.ip().to_string();
            if !state.rate_limiter.record_attempt(&peer_key) {
                queue.push(ServerMessage::error(ErrorKind::RateLimited, "too many authentication attempts"));
                // Rate-limited AUTH is always followed by a close (§4.6,
                // §7). Delay so the queued frame has a chance to flush
                // through the outbound-queue select arm first; notifying
                // immediately would race the close against the flush.
                let close_signal = Arc::clone(close_signal);
                tokio::spawn(async move {
                    tokio::time::sleep(AUTH_FAILURE_CLOSE_DELAY).await;
                    close_signal.notify_one();
                });
                return;
            }
            let (participant_id, reply) = state.manager.handle_auth(&session_id, &auth_token, role, label, public_key);
            match participant_id {
                Some(participant_id) => {
                    state.connections.register((session_id.clone(), participant_id), Arc::clone(queue));
                    *identity = Some(Identity { session_id, participant_id, role });
                    *last_pong = Instant::now();
                    queue.push(reply);
                }
                None => {
                    queue.push(reply);
                    // Non-rate-limited AUTH failure: ERROR + close after a
                    // small delay (§4.6), long enough for the reply to flush.
                    let close_signal = Arc::clone(close_signal);
                    tokio::spawn(async move {
                        tokio::time::sleep(AUTH_FAILURE_CLOSE_DELAY).await;
                        close_signal.notify_one();
                    });
                }
            }
        }
        (None, _) => {
            queue.push(ServerMessage::error(ErrorKind::Authentication, "AUTH must be the first message"));
        }
        (Some(_), ClientMessage::Auth { .. }) => {
            queue.push(ServerMessage::error(ErrorKind::Validation, "already authenticated"));
        }
        (Some(identity), ClientMessage::ParticipantReady { public_key }) => {
            state.manager.handle_participant_ready(&identity.session_id, identity.participant_id, public_key);
        }
        (Some(identity), ClientMessage::SignatureSubmit { public_key, signature_base64 }) => {
            state.manager.handle_signature_submit(&identity.session_id, identity.participant_id, public_key, signature_base64);
        }
        (Some(identity), ClientMessage::TransactionRejected { reason }) => {
            state.manager.handle_transaction_rejected(&identity.session_id, identity.participant_id, reason);
        }
        (Some(identity), ClientMessage::InjectTransaction { transaction_base64, tx_summary, metadata, contract_abi }) => {
            if identity.role != Role::Coordinator {
                queue.push(ServerMessage::error(ErrorKind::Authentication, "only a coordinator connection may inject a transaction"));
                return;
            }
            let Ok(raw_tx) = BASE64.decode(transaction_base64.as_bytes()) else {
                queue.push(ServerMessage::error(ErrorKind::Validation, "transaction_base64 is not valid base64"));
                return;
            };
            if let Err(kind) = state.manager.inject_transaction(&identity.session_id, raw_tx, tx_summary, metadata, contract_abi) {
                queue.push(ServerMessage::error(kind, format!("INJECT_TRANSACTION rejected: {kind}")));
            }
        }
        (Some(_), ClientMessage::Ping) => queue.push(ServerMessage::Pong),
        (Some(_), ClientMessage::Pong) => *last_pong = Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_cap_is_exact() {
        assert!(!exceeds_frame_limit(MAX_FRAME_BYTES));
        assert!(exceeds_frame_limit(MAX_FRAME_BYTES + 1));
    }

    #[test]
    fn undroppable_messages_are_recognized() {
        assert!(is_undroppable(&ServerMessage::TransactionReceived {
            frozen_transaction_base64: String::new(),
            tx_summary: String::new(),
            metadata: None,
            contract_abi: None,
        }));
        assert!(is_undroppable(&ServerMessage::TransactionExecuted { transaction_id: "t".into(), status: "success".into() }));
        assert!(!is_undroppable(&ServerMessage::Ping));
    }

    #[tokio::test]
    async fn outbound_queue_drops_oldest_droppable_message_under_pressure() {
        let queue = OutboundQueue::new();
        for _ in 0..(OUTBOUND_QUEUE_CAPACITY + 10) {
            queue.push(ServerMessage::Ping);
        }
        let mut count = 0;
        while let Ok(_msg) = tokio::time::timeout(Duration::from_millis(10), queue.pop()).await {
            count += 1;
        }
        assert_eq!(count, OUTBOUND_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn outbound_queue_never_drops_transaction_received() {
        let queue = OutboundQueue::new();
        for _ in 0..(OUTBOUND_QUEUE_CAPACITY + 10) {
            queue.push(ServerMessage::Ping);
        }
        queue.push(ServerMessage::TransactionReceived {
            frozen_transaction_base64: "abc".into(),
            tx_summary: "s".into(),
            metadata: None,
            contract_abi: None,
        });
        let mut saw_transaction_received = false;
        while let Ok(msg) = tokio::time::timeout(Duration::from_millis(10), queue.pop()).await {
            if matches!(msg, ServerMessage::TransactionReceived { .. }) {
                saw_transaction_received = true;
            }
        }
        assert!(saw_transaction_received);
    }
}
