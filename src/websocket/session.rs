//! Per-connection WebSocket session: admission, then three cooperating
//! tasks — read, write, heartbeat (`spec.md` §4.3).

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;

use crate::call_store::Role;
use crate::error::AppError;
use crate::signaling::SessionEnvelope;
use crate::state::AppState;

const PONG_WAIT: Duration = Duration::from_secs(70);
const WRITE_WAIT: Duration = Duration::from_secs(10);
const PING_PERIOD: Duration = Duration::from_secs(30);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub call_id: String,
    pub peer_id: Option<String>,
}

/// `GET /api/ws?call_id=&peer_id=` (`spec.md` §4.3, §6.1).
pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let now = Utc::now();

    let admission = if let Some(peer_id) = params.peer_id.clone() {
        state
            .calls
            .validate_peer(&params.call_id, &peer_id, now)
            .map(|(role, call, was_reconnect)| (peer_id, role, call, was_reconnect))
    } else {
        state
            .calls
            .ensure_host_peer_id(&params.call_id, now)
            .map(|(peer_id, call)| (peer_id, Role::Host, call, false))
    };

    let (peer_id, role, call, was_reconnect) = match admission {
        Ok(v) => v,
        Err(err) => return err.into_response(),
    };

    let call_id = params.call_id.clone();
    let peer_online = call.peer_online(role);

    ws.on_upgrade(move |socket| {
        run_session(
            socket, state, call_id, peer_id, role, was_reconnect, peer_online,
        )
    })
}

async fn run_session(
    socket: WebSocket,
    state: AppState,
    call_id: String,
    peer_id: String,
    role: Role,
    was_reconnect: bool,
    peer_online: bool,
) {
    let registration = state.hub.add(&call_id, &peer_id);
    let generation = registration.generation;
    let close_signal = registration.close_signal.clone();

    let (mut ws_tx, mut ws_rx) = socket.split();

    let join = SessionEnvelope::join(&peer_id, role.as_str(), was_reconnect, peer_online);
    if let Some(json) = join.to_json() {
        if tokio::time::timeout(WRITE_WAIT, ws_tx.send(WsMessage::Text(json)))
            .await
            .is_err()
        {
            state.hub.remove(&call_id, &peer_id, generation);
            return;
        }
    }

    if was_reconnect {
        if let Some(json) = SessionEnvelope::peer_reconnected(&peer_id).to_json() {
            state.hub.send_to_other(&call_id, &peer_id, json);
        }
    }

    broadcast_state(&state, &call_id);

    let mut receiver = registration.receiver;
    let write_close_signal = close_signal.clone();
    let mut write_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_PERIOD);
        ticker.tick().await; // first tick fires immediately; consume it.

        loop {
            tokio::select! {
                maybe_payload = receiver.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if tokio::time::timeout(WRITE_WAIT, ws_tx.send(WsMessage::Text(payload)))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if tokio::time::timeout(WRITE_WAIT, ws_tx.send(WsMessage::Ping(Vec::new())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                _ = write_close_signal.notified() => break,
            }
        }
    });

    let read_state = state.clone();
    let read_call_id = call_id.clone();
    let read_peer_id = peer_id.clone();
    let read_close_signal = close_signal.clone();
    let mut read_task = tokio::spawn(async move {
        let mut deadline = Instant::now() + PONG_WAIT;

        loop {
            tokio::select! {
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            handle_inbound(&read_state, &read_call_id, &read_peer_id, &text);
                        }
                        Some(Ok(WsMessage::Pong(_))) => {
                            deadline = Instant::now() + PONG_WAIT;
                        }
                        Some(Ok(WsMessage::Close(_))) => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
                _ = read_close_signal.notified() => break,
            }
        }
    });

    let heartbeat_state = state.clone();
    let heartbeat_call_id = call_id.clone();
    let heartbeat_peer_id = peer_id.clone();
    let heartbeat_close_signal = close_signal.clone();
    let mut heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    match heartbeat_state.calls.get_by_id(&heartbeat_call_id, now) {
                        Ok(call) => {
                            let envelope = SessionEnvelope::state(&call.to_dto());
                            if let Some(json) = envelope.to_json() {
                                if !heartbeat_state.hub.send_to(&heartbeat_call_id, &heartbeat_peer_id, json) {
                                    break;
                                }
                            }
                        }
                        Err(AppError::NotFound) | Err(AppError::Ended) => break,
                        Err(_) => {}
                    }
                }
                _ = heartbeat_close_signal.notified() => break,
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
            heartbeat_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
            heartbeat_task.abort();
        }
        _ = &mut heartbeat_task => {
            read_task.abort();
            write_task.abort();
        }
    }

    // Disconnection is recoverable: never ends the call (`spec.md` §4.3).
    state
        .calls
        .mark_peer_disconnected(&call_id, &peer_id, Utc::now());
    state.hub.remove(&call_id, &peer_id, generation);

    if let Some(json) = SessionEnvelope::peer_disconnected(&peer_id).to_json() {
        state.hub.send_to_other(&call_id, &peer_id, json);
    }
}

fn handle_inbound(state: &AppState, call_id: &str, peer_id: &str, text: &str) {
    let Ok(mut envelope) = serde_json::from_str::<SessionEnvelope>(text) else {
        return;
    };

    if envelope.kind == crate::signaling::envelope::TYPE_PING {
        return;
    }

    // Clients must not spoof `from`.
    envelope.from = Some(peer_id.to_string());
    let Some(payload) = envelope.to_json() else {
        return;
    };

    match envelope.to.as_deref() {
        Some(to) if !to.is_empty() => {
            state.hub.send_to(call_id, to, payload);
        }
        _ => {
            state.hub.send_to_other(call_id, peer_id, payload);
        }
    }
}

fn broadcast_state(state: &AppState, call_id: &str) {
    let now = Utc::now();
    let Ok(call) = state.calls.get_by_id(call_id, now) else {
        return;
    };
    let envelope = SessionEnvelope::state(&call.to_dto());
    if let Some(json) = envelope.to_json() {
        state.hub.broadcast(call_id, json);
    }
}
