//! Audit Record Lifecycle (C8): the store trait a concrete persistence layer implements, plus
//! the status state machine the dispatcher drives.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::AuditRecord;

/// Outbound collaborator: durable storage for audit records (spec §6, "Audit store"). A real
/// deployment backs this with whatever relational store holds zones/targets/users; this crate
/// only depends on the trait.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a newly created (status = active) record.
    async fn create(&self, record: &AuditRecord) -> Result<()>;

    /// Persist the terminal state of a record. Called exactly once per session, on a detached
    /// context so it survives the request context's cancellation (spec §4.7 step 9, §5).
    async fn update_status(&self, record: &AuditRecord) -> Result<()>;

    /// Fetch a record by id. Used by the monitor handler to check "observable only while active"
    /// (spec §6, `/api/ws/monitor/{sessionID}`).
    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>>;
}
