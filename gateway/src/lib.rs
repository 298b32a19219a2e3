//! PAM gateway: axum router exposing `/api/ws/connect/{protocol}/{targetId}` and
//! `/api/ws/monitor/{sessionId}`, plus the minimal outbound-trait implementations that let the
//! crate run standalone (spec §10.6).

pub mod dispatcher;
pub mod monitor_handler;
pub mod stores;
pub mod ws_adapter;

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;

pub use dispatcher::AppState;

/// Build the router: two websocket routes, sharing one [`AppState`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ws/connect/{protocol}/{target_id}", get(dispatcher::connect_handler))
        .route("/api/ws/monitor/{session_id}", get(monitor_handler::monitor_handler))
        .with_state(state)
}

/// Bind and serve `app` at `addr`, with per-connection peer addresses available to handlers via
/// `ConnectInfo`.
pub async fn serve(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "bastion gateway listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
