//! Transport-agnostic websocket seam.
//!
//! `bastion-core` has no HTTP/websocket framework dependency (§10.1: "no HTTP framework
//! dependency"), so C5/C6 cannot take an `axum::extract::ws::WebSocket` directly. This is the
//! trait pair the gateway crate's axum handler implements and hands down; core only ever sees
//! these two traits, the same way it only ever sees `TargetStore`/`SecretStore`/`AuditStore`
//! trait objects for its other outbound collaborators.

use async_trait::async_trait;

use crate::error::Result;

/// One inbound websocket frame, stripped of framework-specific wrapper types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Binary(Vec<u8>),
    Text(String),
    /// Peer sent a close frame, or the connection ended.
    Close,
}

/// Send half of a websocket connection. Implementations are responsible for their own framing;
/// callers serialize all sends through a single owner per session (spec §4.5 step 6, §5).
#[async_trait]
pub trait WsSender: Send {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()>;
    async fn send_text(&mut self, data: String) -> Result<()>;
    /// Send a normal-closure close frame. Best-effort: callers should not treat failure here as
    /// fatal, since the peer may already be gone.
    async fn close(&mut self) -> Result<()>;
}

/// Receive half of a websocket connection.
#[async_trait]
pub trait WsReceiver: Send {
    /// `None` means the stream ended (equivalent to an implicit close).
    async fn recv(&mut self) -> Option<Result<WsMessage>>;
}
