//! Observer websocket (spec §6, `/api/ws/monitor/{sessionID}`): replay the header buffer, then
//! stream subsequent session bytes as binary frames to a live viewer.
//!
//! The banner messages ("started"/"ended") go through `MonitorBus::broadcast_and_record`, which
//! forwards them to the owning proxy's recorder sink (if the session registered one) as well as
//! to peer observers, so they land in the replay file and not just the live bus.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use bastion_core::model::AuditStatus;
use bytes::Bytes;
use uuid::Uuid;

use crate::dispatcher::AppState;

const USER_HEADER: &str = "x-bastion-user";

pub async fn monitor_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let viewer = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    ws.on_upgrade(move |socket| async move {
        match state.audit_store.get(session_id).await {
            Ok(Some(record)) if record.status == AuditStatus::Active => {}
            _ => {
                let mut socket = socket;
                let _ = socket.send(Message::Text("session is not observable".into())).await;
                return;
            }
        }
        run_monitor(socket, state, session_id, viewer).await;
    })
}

async fn run_monitor(mut socket: WebSocket, state: AppState, session_id: Uuid, viewer: String) {
    let (subscriber_id, mut rx) = state.monitor.subscribe(session_id).await;

    let started = format!("[--- Live monitoring by {viewer} started ---]");
    state.monitor.broadcast_and_record(session_id, Bytes::from(started)).await;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(bytes) => {
                        if socket.send(Message::Binary(bytes.to_vec().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }

    let ended = format!("[--- Live monitoring by {viewer} ended ---]");
    state.monitor.broadcast_and_record(session_id, Bytes::from(ended)).await;
    state.monitor.unsubscribe(session_id, subscriber_id).await;
}
