//! Error taxonomy for the session proxying subsystem.
//!
//! Every fallible operation in this crate returns [`GatewayError`] (or a `Result` aliased to it)
//! so the dispatcher can classify a failure into an audit status without string-matching.

use std::fmt;

/// The kinds of failure the core can produce, independent of display message.
///
/// Mirrors the taxonomy table in the specification: each variant carries its own policy
/// (pre-upgrade HTTP status vs. post-upgrade audit finalization) via [`GatewayError::kind`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("handshake violation: {0}")]
    HandshakeViolation(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("transport error: {0}")]
    TransportError(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("session exit: {0}")]
    SessionExit(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Coarse classification used by the dispatcher to decide the audit record's terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    UpstreamUnavailable,
    HandshakeViolation,
    MalformedFrame,
    TransportError,
    SessionExit,
    Cancelled,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::BadRequest(_) => ErrorKind::BadRequest,
            GatewayError::Unauthenticated => ErrorKind::Unauthenticated,
            GatewayError::Forbidden(_) => ErrorKind::Forbidden,
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            GatewayError::HandshakeViolation(_) => ErrorKind::HandshakeViolation,
            GatewayError::MalformedFrame(_) => ErrorKind::MalformedFrame,
            GatewayError::TransportError(_) => ErrorKind::TransportError,
            GatewayError::SessionExit(_) => ErrorKind::SessionExit,
            GatewayError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// True for errors that must not create an audit record (pre-upgrade rejections).
    pub fn is_pre_upgrade(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BadRequest
                | ErrorKind::Unauthenticated
                | ErrorKind::Forbidden
                | ErrorKind::NotFound
        )
    }

    pub fn transport(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        GatewayError::TransportError(Box::new(e))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::HandshakeViolation => "handshake_violation",
            ErrorKind::MalformedFrame => "malformed_frame",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::SessionExit => "session_exit",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
