//! JSON-backed Identity Store
//!
//! Loads a snapshot of users, sessions, targets and group links from disk.
//! Used by the shipped binary and by tests; production deployments can plug
//! any other [`IdentityStore`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::{CallerSession, GroupId, IdentityStore, StoreError, TargetId, TargetRecord, UserId};

/// On-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    #[serde(default)]
    pub targets: Vec<TargetRecord>,
    #[serde(default)]
    pub sessions: Vec<CallerSession>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub links: Vec<GroupLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GroupLink {
    pub group_id: GroupId,
    pub target_id: TargetId,
}

#[derive(Default)]
struct Indexed {
    targets: HashMap<TargetId, TargetRecord>,
    sessions: HashMap<String, CallerSession>,
    user_groups: HashMap<UserId, GroupId>,
    links: HashSet<(GroupId, TargetId)>,
}

impl From<IdentitySnapshot> for Indexed {
    fn from(snapshot: IdentitySnapshot) -> Self {
        Self {
            targets: snapshot.targets.into_iter().map(|t| (t.id, t)).collect(),
            sessions: snapshot
                .sessions
                .into_iter()
                .map(|s| (s.token.clone(), s))
                .collect(),
            user_groups: snapshot
                .users
                .into_iter()
                .map(|u| (u.id, u.group_id))
                .collect(),
            links: snapshot
                .links
                .into_iter()
                .map(|l| (l.group_id, l.target_id))
                .collect(),
        }
    }
}

pub struct JsonIdentityStore {
    path: Option<PathBuf>,
    data: RwLock<Indexed>,
}

impl JsonIdentityStore {
    /// Load the store from a JSON file.
    /// A missing file yields an empty store (every request is then denied).
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = Self::read_snapshot(&path).await?;

        tracing::info!(
            "Identity store loaded from {:?}: {} targets, {} sessions, {} users, {} links",
            path,
            snapshot.targets.len(),
            snapshot.sessions.len(),
            snapshot.users.len(),
            snapshot.links.len()
        );

        Ok(Self {
            path: Some(path),
            data: RwLock::new(snapshot.into()),
        })
    }

    /// Build a store that lives only in memory
    pub fn from_snapshot(snapshot: IdentitySnapshot) -> Self {
        Self {
            path: None,
            data: RwLock::new(snapshot.into()),
        }
    }

    /// Re-read the backing file, replacing the in-memory view atomically
    pub async fn reload(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = Self::read_snapshot(path).await?;
        *self.data.write() = snapshot.into();
        tracing::info!("Identity store reloaded from {:?}", path);
        Ok(())
    }

    async fn read_snapshot(path: &Path) -> Result<IdentitySnapshot, StoreError> {
        match fs::read_to_string(path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Identity store {:?} not found, starting empty", path);
                Ok(IdentitySnapshot::default())
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[async_trait]
impl IdentityStore for JsonIdentityStore {
    async fn get_target(&self, id: TargetId) -> Result<Option<TargetRecord>, StoreError> {
        Ok(self.data.read().targets.get(&id).cloned())
    }

    async fn get_caller_session(&self, token: &str) -> Result<Option<CallerSession>, StoreError> {
        Ok(self.data.read().sessions.get(token).cloned())
    }

    async fn group_of_user(&self, user_id: UserId) -> Result<Option<GroupId>, StoreError> {
        Ok(self.data.read().user_groups.get(&user_id).copied())
    }

    async fn is_group_linked(
        &self,
        group_id: GroupId,
        target_id: TargetId,
    ) -> Result<bool, StoreError> {
        Ok(self.data.read().links.contains(&(group_id, target_id)))
    }
}
