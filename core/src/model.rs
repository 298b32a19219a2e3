//! Entities shared by every component: targets, credentials, and audit records.
//!
//! These are plain data — the stores that own their lifecycle (`TargetStore`, `SecretStore`,
//! `AuditStore`) live in their own modules.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol a [`Target`] speaks. The dispatcher uses this to route to C5 or C6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Rdp,
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ssh" => Some(Protocol::Ssh),
            "rdp" => Some(Protocol::Rdp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Rdp => "rdp",
        }
    }
}

/// An addressable backend endpoint. Created/updated/deleted by external admin flows; the core
/// only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub protocol: Protocol,
    pub enabled: bool,
}

/// Binds a target to a secret-store path and a login name. The core never persists the resolved
/// secret; only this reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRef {
    pub id: Uuid,
    pub target_id: Uuid,
    pub login_name: String,
    /// Either an opaque secret-store path, or the literal `raw:<password>` form used in
    /// development (see [`crate::secret::resolve_credential`]).
    pub secret_path: String,
}

/// A login name plus password and/or private key material, held only for the duration of a
/// session. Never logged — the `Debug` impl below redacts both secrets.
#[derive(Clone, Serialize, Deserialize)]
pub struct ResolvedCredential {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

impl ResolvedCredential {
    /// Invariant: at least one of password/private key present.
    pub fn is_valid(&self) -> bool {
        self.password.as_deref().map(|p| !p.is_empty()).unwrap_or(false)
            || self.private_key.is_some()
    }
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Terminal/active status of an [`AuditRecord`]. Transitions only `Active -> {Completed, Failed,
/// Terminated}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Active,
    Completed,
    Failed,
    /// Reserved for operator-forced termination; not produced by the core alone.
    Terminated,
}

/// Per-session audit log line. Created when a session is admitted; updated exactly once, when
/// the session ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub user_id: String,
    pub target_id: Uuid,
    pub credential_id: Uuid,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub status: AuditStatus,
    pub client_addr: String,
    pub error_message: Option<String>,
    pub recording_path: Option<String>,
}

impl AuditRecord {
    pub fn new(
        user_id: String,
        target_id: Uuid,
        credential_id: Uuid,
        client_addr: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            target_id,
            credential_id,
            start_time: chrono::Utc::now(),
            end_time: None,
            bytes_sent: 0,
            bytes_received: 0,
            status: AuditStatus::Active,
            client_addr,
            error_message: None,
            recording_path: None,
        }
    }

    /// Stamp the terminal state. Idempotent only in the sense that callers must call this
    /// exactly once per the invariant in §3 — a second call would violate "updated exactly once"
    /// but is not itself guarded here since the dispatcher is the sole caller.
    pub fn finish(
        &mut self,
        status: AuditStatus,
        bytes_sent: u64,
        bytes_received: u64,
        error_message: Option<String>,
        recording_path: Option<String>,
    ) {
        debug_assert!(matches!(
            status,
            AuditStatus::Completed | AuditStatus::Failed | AuditStatus::Terminated
        ));
        self.end_time = Some(chrono::Utc::now());
        self.bytes_sent = bytes_sent;
        self.bytes_received = bytes_received;
        self.status = status;
        self.error_message = error_message;
        self.recording_path = recording_path;
    }
}
