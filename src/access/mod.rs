//! Access Guard
//!
//! Decides whether a caller session may open a terminal to a target host.
//! The rule: the caller's session exists and has not expired, the caller's
//! user belongs to a group, and that group is linked to the target.
//!
//! Every lookup failure is a denial. Nothing here mutates the store.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::identity::{CallerSession, GroupId, IdentityStore, TargetId, UserId};

/// Why a caller was turned away. The `Display` text is the close reason
/// sent to the browser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("No session cookie found")]
    NoSessionCookie,

    #[error("Invalid or expired session")]
    InvalidSession,

    #[error("Virtual user not found")]
    TargetNotFound,

    #[error("Access denied")]
    Denied,
}

/// Proof that a caller passed the guard for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedCaller {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub target_id: TargetId,
}

pub struct AccessGuard {
    store: Arc<dyn IdentityStore>,
}

impl AccessGuard {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    /// Boolean form of [`AccessGuard::check`]
    pub async fn authorize(&self, session_token: &str, target_id: TargetId) -> bool {
        self.check(Some(session_token), target_id).await.is_ok()
    }

    /// Run the full check, reporting which step refused the caller.
    ///
    /// The session is validated before the target is looked up so that an
    /// anonymous caller cannot probe which target ids exist.
    pub async fn check(
        &self,
        session_token: Option<&str>,
        target_id: TargetId,
    ) -> Result<AuthorizedCaller, AccessError> {
        let token = session_token
            .filter(|t| !t.is_empty())
            .ok_or(AccessError::NoSessionCookie)?;

        let session = self.live_session(token).await?;

        match self.store.get_target(target_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(AccessError::TargetNotFound),
            Err(e) => {
                warn!("Target lookup for {} failed, denying: {}", target_id, e);
                return Err(AccessError::TargetNotFound);
            }
        }

        let group_id = match self.store.group_of_user(session.user_id).await {
            Ok(Some(group_id)) => group_id,
            Ok(None) => {
                debug!("User {} has no group", session.user_id);
                return Err(AccessError::Denied);
            }
            Err(e) => {
                warn!("Group lookup for user {} failed, denying: {}", session.user_id, e);
                return Err(AccessError::Denied);
            }
        };

        match self.store.is_group_linked(group_id, target_id).await {
            Ok(true) => Ok(AuthorizedCaller {
                user_id: session.user_id,
                group_id,
                target_id,
            }),
            Ok(false) => {
                debug!(
                    "Group {} is not linked to target {} (user {})",
                    group_id, target_id, session.user_id
                );
                Err(AccessError::Denied)
            }
            Err(e) => {
                warn!("Link lookup failed, denying: {}", e);
                Err(AccessError::Denied)
            }
        }
    }

    /// Whether `session_token` still names an unexpired caller session.
    /// Used to revoke running terminals after the store changes.
    pub async fn session_is_live(&self, session_token: &str) -> bool {
        self.live_session(session_token).await.is_ok()
    }

    async fn live_session(&self, token: &str) -> Result<CallerSession, AccessError> {
        let session = match self.store.get_caller_session(token).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!("Unknown caller session");
                return Err(AccessError::InvalidSession);
            }
            Err(e) => {
                warn!("Session lookup failed, denying: {}", e);
                return Err(AccessError::InvalidSession);
            }
        };

        if session.is_expired_at(chrono::Utc::now().timestamp()) {
            debug!("Caller session for user {} has expired", session.user_id);
            return Err(AccessError::InvalidSession);
        }
        Ok(session)
    }
}
