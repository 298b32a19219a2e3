//! Minimal, swappable implementations of the three outbound traits `bastion-core` depends on
//! (spec §6, §10.6). These exist so the gateway builds and runs without a real admin database,
//! secret manager, or identity provider — not to compete with those systems.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bastion_core::error::{GatewayError, Result};
use bastion_core::model::{AuditRecord, AuditStatus, CredentialRef, ResolvedCredential, Target};
use bastion_core::{audit::AuditStore, secret::SecretStore, target_store::TargetStore};
use dashmap::DashMap;
use rusqlite::{params, Connection};
use uuid::Uuid;

/// `DashMap<Uuid, Target>` + `DashMap<Uuid, Vec<CredentialRef>>`, grounded on the teacher's
/// `Registry = Arc<DashMap<SessionId, SessionContext>>` shape.
#[derive(Default)]
pub struct InMemoryTargetStore {
    targets: DashMap<Uuid, Target>,
    credentials: DashMap<Uuid, Vec<CredentialRef>>,
}

impl InMemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_target(&self, target: Target) {
        self.targets.insert(target.id, target);
    }

    pub fn insert_credential(&self, credential: CredentialRef) {
        self.credentials.entry(credential.target_id).or_default().push(credential);
    }
}

#[async_trait]
impl TargetStore for InMemoryTargetStore {
    async fn get_target_by_id(&self, id: Uuid) -> Result<Option<Target>> {
        Ok(self.targets.get(&id).map(|e| e.clone()))
    }

    async fn get_credentials_by_target_id(&self, target_id: Uuid) -> Result<Vec<CredentialRef>> {
        Ok(self.credentials.get(&target_id).map(|e| e.clone()).unwrap_or_default())
    }
}

/// Resolves a non-`raw:` secret path by treating it as an environment variable name holding
/// `username:password`. A stand-in for "consult the external secret store" (spec §1 out of
/// scope: "the secret store client").
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_credentials(&self, path: &str) -> Result<ResolvedCredential> {
        let value = std::env::var(path)
            .map_err(|_| GatewayError::UpstreamUnavailable(format!("secret env var {path} not set")))?;
        let (username, password) = value
            .split_once(':')
            .ok_or_else(|| GatewayError::UpstreamUnavailable(format!("secret env var {path} is not username:password")))?;
        Ok(ResolvedCredential {
            username: username.to_string(),
            password: Some(password.to_string()),
            private_key: None,
        })
    }
}

/// Single `audit_records` table, opened the way the teacher's `db.rs` opens `vibearound.db`
/// (WAL mode, `rusqlite`). All calls are wrapped in `spawn_blocking` since the rest of the
/// gateway is async and `rusqlite` is not.
pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
    pub fn open(db_path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS audit_records (
                id             TEXT PRIMARY KEY,
                user_id        TEXT NOT NULL,
                target_id      TEXT NOT NULL,
                credential_id  TEXT NOT NULL,
                start_time     TEXT NOT NULL,
                end_time       TEXT,
                bytes_sent     INTEGER NOT NULL DEFAULT 0,
                bytes_received INTEGER NOT NULL DEFAULT 0,
                status         TEXT NOT NULL,
                client_addr    TEXT NOT NULL,
                error_message  TEXT,
                recording_path TEXT
            );
            ",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn insert(conn: &Connection, record: &AuditRecord) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO audit_records (id, user_id, target_id, credential_id, start_time, end_time,
                bytes_sent, bytes_received, status, client_addr, error_message, recording_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id.to_string(),
                record.user_id,
                record.target_id.to_string(),
                record.credential_id.to_string(),
                record.start_time.to_rfc3339(),
                record.end_time.map(|t| t.to_rfc3339()),
                record.bytes_sent,
                record.bytes_received,
                status_str(record.status),
                record.client_addr,
                record.error_message,
                record.recording_path,
            ],
        )?;
        Ok(())
    }

    fn update(conn: &Connection, record: &AuditRecord) -> rusqlite::Result<()> {
        conn.execute(
            "UPDATE audit_records SET end_time = ?1, bytes_sent = ?2, bytes_received = ?3,
                status = ?4, error_message = ?5, recording_path = ?6 WHERE id = ?7",
            params![
                record.end_time.map(|t| t.to_rfc3339()),
                record.bytes_sent,
                record.bytes_received,
                status_str(record.status),
                record.error_message,
                record.recording_path,
                record.id.to_string(),
            ],
        )?;
        Ok(())
    }

    fn select(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<AuditRecord>> {
        conn.query_row(
            "SELECT id, user_id, target_id, credential_id, start_time, end_time, bytes_sent,
                bytes_received, status, client_addr, error_message, recording_path
             FROM audit_records WHERE id = ?1",
            params![id.to_string()],
            |row| {
                let id: String = row.get(0)?;
                let target_id: String = row.get(2)?;
                let credential_id: String = row.get(3)?;
                let start_time: String = row.get(4)?;
                let end_time: Option<String> = row.get(5)?;
                let status: String = row.get(8)?;
                Ok(AuditRecord {
                    id: Uuid::parse_str(&id).unwrap_or_default(),
                    user_id: row.get(1)?,
                    target_id: Uuid::parse_str(&target_id).unwrap_or_default(),
                    credential_id: Uuid::parse_str(&credential_id).unwrap_or_default(),
                    start_time: chrono::DateTime::parse_from_rfc3339(&start_time)
                        .map(|t| t.with_timezone(&chrono::Utc))
                        .unwrap_or_else(|_| chrono::Utc::now()),
                    end_time: end_time.and_then(|t| {
                        chrono::DateTime::parse_from_rfc3339(&t).ok().map(|t| t.with_timezone(&chrono::Utc))
                    }),
                    bytes_sent: row.get(6)?,
                    bytes_received: row.get(7)?,
                    status: parse_status(&status),
                    client_addr: row.get(9)?,
                    error_message: row.get(10)?,
                    recording_path: row.get(11)?,
                })
            },
        )
        .map(Some)
        .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e) })
    }
}

fn status_str(status: AuditStatus) -> &'static str {
    match status {
        AuditStatus::Active => "active",
        AuditStatus::Completed => "completed",
        AuditStatus::Failed => "failed",
        AuditStatus::Terminated => "terminated",
    }
}

fn parse_status(s: &str) -> AuditStatus {
    match s {
        "completed" => AuditStatus::Completed,
        "failed" => AuditStatus::Failed,
        "terminated" => AuditStatus::Terminated,
        _ => AuditStatus::Active,
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn create(&self, record: &AuditRecord) -> Result<()> {
        let conn = self.conn.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            Self::insert(&conn, &record)
        })
        .await
        .map_err(GatewayError::transport)?
        .map_err(GatewayError::transport)
    }

    async fn update_status(&self, record: &AuditRecord) -> Result<()> {
        let conn = self.conn.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            Self::update(&conn, &record)
        })
        .await
        .map_err(GatewayError::transport)?
        .map_err(GatewayError::transport)
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            Self::select(&conn, id)
        })
        .await
        .map_err(GatewayError::transport)?
        .map_err(GatewayError::transport)
    }
}
