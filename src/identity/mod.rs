//! Identity Store interface
//!
//! Users, caller sessions, groups and target hosts are owned by an external
//! store. The bridge only reads from it through [`IdentityStore`].

mod store;

pub use store::{GroupLink, IdentitySnapshot, JsonIdentityStore, UserRecord};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type TargetId = i64;
pub type UserId = i64;
pub type GroupId = i64;

/// A remote machine account a caller may open a terminal to.
///
/// Secret fields hold ciphertext produced by the Secrets Service.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: TargetId,

    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Remote account name
    pub username: String,

    /// Encrypted password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Encrypted private key (PEM / OpenSSH text)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,

    /// Key algorithm tag, e.g. "RSA", "ECDSA", "Ed25519"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_type: Option<String>,

    /// Encrypted key passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for TargetRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRecord")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("has_password", &self.password.is_some())
            .field("has_ssh_key", &self.ssh_key.is_some())
            .field("ssh_key_type", &self.ssh_key_type)
            .finish()
    }
}

fn default_port() -> u16 {
    22
}

/// A logged-in browser session, identified by the `session` cookie
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerSession {
    pub token: String,
    pub user_id: UserId,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds
    pub expires_at: i64,
}

impl CallerSession {
    pub fn is_expired_at(&self, now_secs: i64) -> bool {
        self.expires_at < now_secs
    }
}

/// Identity store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Identity store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read-only view of the external Identity Store
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_target(&self, id: TargetId) -> Result<Option<TargetRecord>, StoreError>;

    async fn get_caller_session(&self, token: &str) -> Result<Option<CallerSession>, StoreError>;

    async fn group_of_user(&self, user_id: UserId) -> Result<Option<GroupId>, StoreError>;

    async fn is_group_linked(&self, group_id: GroupId, target_id: TargetId)
        -> Result<bool, StoreError>;
}
