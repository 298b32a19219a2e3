//! Outbound collaborator: secret resolution (spec §6, "Secret store"), plus the `raw:` development
//! shortcut that is the core's own responsibility (spec §4.7 step 5).

use async_trait::async_trait;

use crate::error::{GatewayError, Result};
use crate::model::{CredentialRef, ResolvedCredential};

/// Literal prefix marking a credential reference's secret path as a bare development password
/// rather than an opaque secret-store path.
pub const RAW_PREFIX: &str = "raw:";

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolve an opaque secret-store path to a username/password/key record. Must yield at
    /// least one of password/private key.
    async fn get_credentials(&self, path: &str) -> Result<ResolvedCredential>;
}

/// Resolve a [`CredentialRef`] to a [`ResolvedCredential`]: the `raw:` branch is handled here
/// (never touches the secret store); anything else is delegated to `store`.
pub async fn resolve_credential(
    store: &dyn SecretStore,
    credential: &CredentialRef,
) -> Result<ResolvedCredential> {
    if let Some(password) = credential.secret_path.strip_prefix(RAW_PREFIX) {
        return Ok(ResolvedCredential {
            username: credential.login_name.clone(),
            password: Some(password.to_string()),
            private_key: None,
        });
    }

    let resolved = store.get_credentials(&credential.secret_path).await?;
    if !resolved.is_valid() {
        return Err(GatewayError::UpstreamUnavailable(
            "secret store returned neither password nor private key".into(),
        ));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct NeverCalled;

    #[async_trait]
    impl SecretStore for NeverCalled {
        async fn get_credentials(&self, _path: &str) -> Result<ResolvedCredential> {
            panic!("raw: branch must not consult the secret store");
        }
    }

    #[tokio::test]
    async fn raw_prefix_with_empty_password_resolves_but_is_not_valid_for_ssh_auth() {
        let cred = CredentialRef {
            id: Uuid::new_v4(),
            target_id: Uuid::new_v4(),
            login_name: "alice".into(),
            secret_path: "raw:".into(),
        };
        let resolved = resolve_credential(&NeverCalled, &cred).await.unwrap();
        assert_eq!(resolved.username, "alice");
        assert_eq!(resolved.password.as_deref(), Some(""));
        assert!(!resolved.is_valid());
    }

    #[tokio::test]
    async fn raw_prefix_with_password() {
        let cred = CredentialRef {
            id: Uuid::new_v4(),
            target_id: Uuid::new_v4(),
            login_name: "alice".into(),
            secret_path: "raw:hunter2".into(),
        };
        let resolved = resolve_credential(&NeverCalled, &cred).await.unwrap();
        assert_eq!(resolved.password.as_deref(), Some("hunter2"));
        assert!(resolved.is_valid());
    }
}
