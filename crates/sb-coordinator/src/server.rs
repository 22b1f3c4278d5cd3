//! WebSocket transport server.
//!
//! One route, `/ws`. A connected socket must complete the register
//! handshake within the auth deadline or it is closed. Outbound frames per
//! connection go through an mpsc channel drained by a writer task, so
//! transport writes are serialised; the channel's sender is the handle the
//! registry stores for the worker.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use sb_core::limits::AUTH_DEADLINE_MS;
use sb_protocol::payload::RegisterAckPayload;
use sb_protocol::{Envelope, MessageKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::manager::TaskManager;
use crate::registry::{RegistryError, WorkerRegistry};
use crate::transfer::AttachmentTransfers;

const OUTBOUND_CAPACITY: usize = 256;

pub struct ServerState {
    pub registry: Arc<WorkerRegistry>,
    pub manager: Arc<TaskManager>,
    pub transfers: Arc<AttachmentTransfers>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

/// WebSocket GET /ws -- the worker control plane.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_CAPACITY);

    // Writer task: the only place that touches the sink.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let text = match envelope.encode() {
                Ok(text) => text,
                Err(error) => {
                    warn!(%error, "failed to encode outbound frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // The first frame must be a valid, authenticated worker:register.
    let worker_id = match authenticate(&mut ws_rx, &outbound_tx, &state).await {
        Some(worker_id) => worker_id,
        None => {
            drop(outbound_tx);
            let _ = writer.await;
            return;
        }
    };

    // Serve until the socket closes.
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&state, &worker_id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong/binary
            Err(error) => {
                debug!(worker = %worker_id, %error, "transport error");
                break;
            }
        }
    }

    info!(worker = %worker_id, "socket closed");
    state
        .registry
        .deregister_connection(&worker_id, &outbound_tx)
        .await;
    drop(outbound_tx);
    let _ = writer.await;
}

/// Run the register handshake; `None` closes the connection.
async fn authenticate(
    ws_rx: &mut (impl futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin),
    outbound_tx: &mpsc::Sender<Envelope>,
    state: &Arc<ServerState>,
) -> Option<String> {
    let deadline = Duration::from_millis(AUTH_DEADLINE_MS);
    let first = tokio::time::timeout(deadline, ws_rx.next()).await;

    let text = match first {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            warn!("connection closed before registration");
            return None;
        }
        Err(_) => {
            warn!("connection failed to authenticate in time");
            return None;
        }
    };

    let envelope = match Envelope::decode(&text) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(%error, "malformed frame during handshake");
            return None;
        }
    };
    if envelope.kind != MessageKind::WorkerRegister {
        warn!(kind = %envelope.kind, "expected worker:register as first frame");
        return None;
    }
    let payload = match envelope.payload_as() {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%error, "bad register payload");
            return None;
        }
    };

    match state.registry.register(payload, outbound_tx.clone()).await {
        Ok(info) => Some(info.name),
        Err(RegistryError::AuthFailure) => {
            // Reject explicitly, then close; the ack goes straight through
            // the channel since no worker record exists.
            let ack = RegisterAckPayload {
                success: false,
                message: Some("authentication failed".to_string()),
            };
            if let Ok(envelope) = Envelope::from_payload(MessageKind::WorkerRegisterAck, &ack) {
                let _ = outbound_tx.send(envelope).await;
            }
            None
        }
    }
}

/// Route one authenticated frame.
async fn dispatch(state: &Arc<ServerState>, worker_id: &str, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(worker = worker_id, %error, "dropping malformed frame");
            return;
        }
    };

    match envelope.kind {
        MessageKind::WorkerHeartbeat => match envelope.payload_as() {
            Ok(payload) => state.registry.heartbeat(worker_id, payload).await,
            Err(error) => warn!(worker = worker_id, %error, "bad heartbeat payload"),
        },
        MessageKind::TaskStream => {
            let Some(task_id) = envelope.task_id.as_deref() else {
                warn!(worker = worker_id, "task:stream without taskId");
                return;
            };
            match envelope.payload_as() {
                Ok(event) => state.manager.handle_stream(task_id, event).await,
                Err(error) => warn!(worker = worker_id, %error, "bad stream payload"),
            }
        }
        MessageKind::TaskComplete => {
            let Some(task_id) = envelope.task_id.as_deref() else {
                warn!(worker = worker_id, "task:complete without taskId");
                return;
            };
            match envelope.payload_as() {
                Ok(payload) => state.manager.handle_complete(task_id, payload).await,
                Err(error) => warn!(worker = worker_id, %error, "bad complete payload"),
            }
        }
        MessageKind::TaskError => {
            let Some(task_id) = envelope.task_id.as_deref() else {
                warn!(worker = worker_id, "task:error without taskId");
                return;
            };
            match envelope.payload_as() {
                Ok(payload) => state.manager.handle_error(task_id, payload).await,
                Err(error) => warn!(worker = worker_id, %error, "bad error payload"),
            }
        }
        MessageKind::TaskQuestion => {
            if let Some(task_id) = envelope.task_id.as_deref() {
                state.manager.handle_question(task_id, envelope.payload).await;
            }
        }
        MessageKind::TaskPermission => {
            if let Some(task_id) = envelope.task_id.as_deref() {
                state.manager.handle_permission(task_id, envelope.payload).await;
            }
        }
        MessageKind::FileTransferAck => {
            let Some(task_id) = envelope.task_id.as_deref() else {
                warn!(worker = worker_id, "file:transfer_ack without taskId");
                return;
            };
            match envelope.payload_as() {
                Ok(payload) => state.transfers.handle_ack(task_id, payload).await,
                Err(error) => warn!(worker = worker_id, %error, "bad transfer ack payload"),
            }
        }
        MessageKind::TeamUpdate => {
            state
                .manager
                .handle_team_update(worker_id, envelope.payload)
                .await;
        }
        other => {
            warn!(worker = worker_id, kind = %other, "unexpected frame dropped");
        }
    }
}
