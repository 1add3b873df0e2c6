//! Active Session Registry
//!
//! Thread-safe tracking of live terminal sessions using DashMap. Enforces
//! the concurrent session limit and lets the server cancel sessions by id,
//! by caller (logout) or all at once (shutdown).
//!
//! A session is registered for as long as its [`SessionLease`] lives.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::SessionError;
use super::terminal::BridgeState;
use crate::identity::TargetId;

struct SessionEntry {
    target_id: TargetId,
    caller_token: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: watch::Receiver<BridgeState>,
}

/// Snapshot of one registered session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub target_id: TargetId,
    pub state: BridgeState,
    pub started_at: DateTime<Utc>,
}

pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionEntry>,
    max_sessions: usize,
    /// Serializes the count check with the insert
    register_lock: parking_lot::Mutex<()>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            max_sessions,
            register_lock: parking_lot::Mutex::new(()),
        })
    }

    /// Register a new session in `Connecting` state
    pub fn register(
        self: &Arc<Self>,
        id: Uuid,
        target_id: TargetId,
        caller_token: &str,
    ) -> Result<SessionLease, SessionError> {
        let _guard = self.register_lock.lock();

        if self.sessions.len() >= self.max_sessions {
            info!(
                "Rejecting session for target {}: {} sessions active",
                target_id,
                self.sessions.len()
            );
            return Err(SessionError::RegistryFull {
                limit: self.max_sessions,
            });
        }

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(BridgeState::Connecting);

        self.sessions.insert(
            id,
            SessionEntry {
                target_id,
                caller_token: caller_token.to_string(),
                started_at: Utc::now(),
                cancel: cancel.clone(),
                state: state_rx,
            },
        );
        debug!("Registered session {} for target {}", id, target_id);

        Ok(SessionLease {
            id,
            registry: self.clone(),
            cancel,
            state: state_tx,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn state(&self, id: &Uuid) -> Option<BridgeState> {
        self.sessions.get(id).map(|entry| *entry.state.borrow())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| SessionInfo {
                id: *entry.key(),
                target_id: entry.target_id,
                state: *entry.state.borrow(),
                started_at: entry.started_at,
            })
            .collect()
    }

    /// Distinct caller tokens with at least one live session
    pub fn caller_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.caller_token.clone())
            .collect();
        tokens.sort();
        tokens.dedup();
        tokens
    }

    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.sessions.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every session opened with this caller token (logout)
    pub fn cancel_caller(&self, caller_token: &str) -> usize {
        let mut cancelled = 0;
        for entry in self.sessions.iter() {
            if entry.caller_token == caller_token {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("Cancelled {} session(s) for logged-out caller", cancelled);
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    fn remove(&self, id: &Uuid) {
        if self.sessions.remove(id).is_some() {
            debug!("Deregistered session {}", id);
        }
    }
}

/// Registration handle held by the supervisor; deregisters on drop
pub struct SessionLease {
    id: Uuid,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
    state: watch::Sender<BridgeState>,
}

impl SessionLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &watch::Sender<BridgeState> {
        &self.state
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
