//! Connection Dispatcher (C7): admission, target/credential resolution, websocket upgrade, and
//! audit record lifecycle around the SSH/RDP proxies.
//!
//! Grounded on `web_server.rs`'s `ws_handler`/`create_session_handler`/`handle_socket_attach`
//! route-handler shape: axum `State`/`Query`/`Path` extractors, `ws.on_upgrade(move |socket| ...)`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bastion_core::audit::AuditStore;
use bastion_core::error::{ErrorKind, GatewayError, Result};
use bastion_core::model::{AuditRecord, AuditStatus, Protocol, ResolvedCredential, Target};
use bastion_core::monitor::MonitorBus;
use bastion_core::rdp_proxy::RdpProxy;
use bastion_core::secret::{resolve_credential, SecretStore};
use bastion_core::ssh_proxy::SshProxy;
use bastion_core::stats::SessionStats;
use bastion_core::target_store::TargetStore;
use bastion_core::ws::WsSender;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ws_adapter::{AxumWsReceiver, AxumWsSender};

/// Header carrying the pre-authenticated user id. This gateway has no auth middleware of its
/// own (spec §1: "trusts a pre-authenticated user id handed to it the way an upstream gateway
/// would") — an upstream reverse proxy is expected to set this after terminating real auth.
const USER_HEADER: &str = "x-bastion-user";

const DEFAULT_RDP_WIDTH: u32 = 1024;
const DEFAULT_RDP_HEIGHT: u32 = 768;
/// Detached audit-finalization timeout (spec §4.7 step 9, §5: "a fresh 5-second context").
const AUDIT_FINALIZE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub target_store: Arc<dyn TargetStore>,
    pub secret_store: Arc<dyn SecretStore>,
    pub audit_store: Arc<dyn AuditStore>,
    pub monitor: MonitorBus,
    pub ssh_proxy: Arc<SshProxy>,
    pub rdp_proxy: Arc<RdpProxy>,
    /// Cancelled on graceful shutdown; every session's context is a child of this token.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub credential_id: Option<Uuid>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

struct Admission {
    user_id: String,
    target: Target,
    credential_id: Uuid,
    resolved: ResolvedCredential,
}

/// `GET /api/ws/connect/{protocol}/{targetID}` (spec §4.7).
pub async fn connect_handler(
    State(state): State<AppState>,
    Path((protocol, target_id)): Path<(String, String)>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let admission = match admit(&state, &protocol, &target_id, &query, &headers).await {
        Ok(a) => a,
        Err(e) => return error_response(&e),
    };

    let protocol = admission.target.protocol;
    let width = query.width.filter(|v| *v > 0).map(|v| v as u32).unwrap_or(DEFAULT_RDP_WIDTH);
    let height = query.height.filter(|v| *v > 0).map(|v| v as u32).unwrap_or(DEFAULT_RDP_HEIGHT);
    let client_addr = peer.to_string();

    ws.protocols(["guacamole"]).on_upgrade(move |socket| async move {
        let session_span = tracing::info_span!("session", user_id = %admission.user_id, target_id = %admission.target.id);
        let _enter = session_span.enter();

        let mut record = AuditRecord::new(
            admission.user_id.clone(),
            admission.target.id,
            admission.credential_id,
            client_addr,
        );
        let (sink, stream) = socket.split();
        let mut ws_tx: Box<dyn bastion_core::ws::WsSender> = Box::new(AxumWsSender(sink));
        let ws_rx: Box<dyn bastion_core::ws::WsReceiver> = Box::new(AxumWsReceiver(stream));

        if let Err(e) = state.audit_store.create(&record).await {
            tracing::error!(error = %e, "failed to persist audit record, closing session");
            let _ = ws_tx.send_text("audit persistence failed, closing".to_string()).await;
            let _ = ws_tx.close().await;
            return;
        }

        let cancel = state.shutdown.child_token();
        let outcome = match protocol {
            Protocol::Ssh => {
                state
                    .ssh_proxy
                    .handle(cancel, ws_tx, ws_rx, &admission.target, &admission.resolved, &record)
                    .await
            }
            Protocol::Rdp => {
                state
                    .rdp_proxy
                    .handle(cancel, ws_tx, ws_rx, &admission.target, &admission.resolved, &record, width, height)
                    .await
            }
        };

        finalize(&state, &mut record, outcome).await;
    })
}

async fn admit(
    state: &AppState,
    protocol: &str,
    target_id: &str,
    query: &ConnectQuery,
    headers: &HeaderMap,
) -> Result<Admission> {
    let user_id = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(GatewayError::Unauthenticated)?
        .to_string();

    let protocol = Protocol::parse(protocol)
        .ok_or_else(|| GatewayError::BadRequest(format!("unknown protocol {protocol}")))?;
    let target_id = Uuid::parse_str(target_id)
        .map_err(|_| GatewayError::BadRequest(format!("invalid target id {target_id}")))?;

    let target = state
        .target_store
        .get_target_by_id(target_id)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("target {target_id}")))?;
    if !target.enabled {
        return Err(GatewayError::Forbidden(format!("target {target_id} is disabled")));
    }
    if target.protocol != protocol {
        return Err(GatewayError::BadRequest(format!(
            "target {target_id} speaks {:?}, not {:?}",
            target.protocol, protocol
        )));
    }

    let credentials = state.target_store.get_credentials_by_target_id(target_id).await?;
    let credential = query
        .credential_id
        .and_then(|id| credentials.iter().find(|c| c.id == id))
        .or_else(|| credentials.first())
        .ok_or_else(|| GatewayError::BadRequest(format!("no credentials configured for target {target_id}")))?
        .clone();

    let resolved = resolve_credential(state.secret_store.as_ref(), &credential).await?;

    Ok(Admission { user_id, target, credential_id: credential.id, resolved })
}

async fn finalize(state: &AppState, record: &mut AuditRecord, outcome: Result<SessionStats>) {
    let (status, stats, error_message) = match outcome {
        Ok(stats) => (AuditStatus::Completed, stats, None),
        Err(e) => (AuditStatus::Failed, SessionStats::default(), Some(e.to_string())),
    };
    record.finish(status, stats.bytes_sent, stats.bytes_received, error_message, stats.recording_path);

    let store = state.audit_store.clone();
    let persisted = tokio::time::timeout(AUDIT_FINALIZE_TIMEOUT, store.update_status(record)).await;
    match persisted {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "failed to persist final audit status"),
        Err(_) => tracing::error!("timed out persisting final audit status"),
    }
}

fn error_response(err: &GatewayError) -> Response {
    let status = match err.kind() {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string()).into_response()
}
