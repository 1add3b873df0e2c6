//! Credential Resolver
//!
//! Turns a stored target record into a connect-ready [`CredentialBundle`].
//! Secret fields are decrypted on demand into zeroizing buffers; the bundle
//! is moved into the SSH connector and dropped when the attempt ends.

use std::sync::Arc;

use tracing::debug;
use zeroize::Zeroizing;

use crate::identity::{IdentityStore, StoreError, TargetId, TargetRecord};
use crate::secrets::{SecretsError, SecretsService};

/// Decrypted connection material for one target
pub struct CredentialBundle {
    pub target_id: TargetId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<Zeroizing<String>>,
    pub private_key: Option<Zeroizing<String>>,
    /// Raw algorithm tag as stored; validated by the connector
    pub key_type: Option<String>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl CredentialBundle {
    /// Bundle for password authentication (mostly useful in tests and tooling)
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            target_id: 0,
            host: host.into(),
            port,
            username: username.into(),
            password: Some(Zeroizing::new(password.into())),
            private_key: None,
            key_type: None,
            passphrase: None,
        }
    }

    /// Bundle for public key authentication
    pub fn with_key(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        private_key: impl Into<String>,
        key_type: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            target_id: 0,
            host: host.into(),
            port,
            username: username.into(),
            password: None,
            private_key: Some(Zeroizing::new(private_key.into())),
            key_type: Some(key_type.into()),
            passphrase: passphrase.map(Zeroizing::new),
        }
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("target_id", &self.target_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("key_type", &self.key_type)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Credential resolution errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Target {0} not found")]
    NotFound(TargetId),

    #[error("Failed to decrypt {field} for target {target_id}: {source}")]
    Decrypt {
        target_id: TargetId,
        field: &'static str,
        #[source]
        source: SecretsError,
    },

    #[error("Identity store error: {0}")]
    Store(#[from] StoreError),
}

pub struct CredentialResolver {
    store: Arc<dyn IdentityStore>,
    secrets: Arc<dyn SecretsService>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn IdentityStore>, secrets: Arc<dyn SecretsService>) -> Self {
        Self { store, secrets }
    }

    pub async fn resolve(&self, target_id: TargetId) -> Result<CredentialBundle, CredentialError> {
        let record = self
            .store
            .get_target(target_id)
            .await?
            .ok_or(CredentialError::NotFound(target_id))?;

        self.decrypt_record(record)
    }

    fn decrypt_record(&self, record: TargetRecord) -> Result<CredentialBundle, CredentialError> {
        let target_id = record.id;
        let password = self.decrypt_field(target_id, "password", record.password.as_deref())?;
        let private_key = self.decrypt_field(target_id, "private key", record.ssh_key.as_deref())?;
        let passphrase =
            self.decrypt_field(target_id, "passphrase", record.passphrase.as_deref())?;

        debug!(
            "Resolved credentials for target {} (password: {}, key: {})",
            target_id,
            password.is_some(),
            private_key.is_some()
        );

        Ok(CredentialBundle {
            target_id,
            host: record.host,
            port: record.port,
            username: record.username,
            password,
            private_key,
            key_type: record.ssh_key_type.filter(|t| !t.trim().is_empty()),
            passphrase,
        })
    }

    /// Empty stored fields count as absent
    fn decrypt_field(
        &self,
        target_id: TargetId,
        field: &'static str,
        ciphertext: Option<&str>,
    ) -> Result<Option<Zeroizing<String>>, CredentialError> {
        match ciphertext.map(str::trim) {
            None | Some("") => Ok(None),
            Some(ct) => self
                .secrets
                .decrypt(ct)
                .map(Some)
                .map_err(|source| CredentialError::Decrypt {
                    target_id,
                    field,
                    source,
                }),
        }
    }
}
