//! Outbound collaborator: target + credential-reference lookup (spec §6, "Target store").
//!
//! Grounded on the teacher's `TunnelBackend` trait shape (`tunnels.rs`): one trait, swappable
//! implementations behind it, the core depending only on the trait object.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{CredentialRef, Target};

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn get_target_by_id(&self, id: Uuid) -> Result<Option<Target>>;

    async fn get_credentials_by_target_id(&self, target_id: Uuid) -> Result<Vec<CredentialRef>>;
}
