//! JSON state file backing all store traits
//!
//! Holds channels, users and tokens in one file. All writes use atomic
//! temp-file + rename to prevent corruption on crash. A tokio Mutex
//! serializes writes from status flips and quota syncs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::account::{SubjectKey, TokenRecord, UserRecord};
use crate::channel::{Channel, ChannelStatus};
use crate::store::{ChannelStore, QuotaStore, Result, StoreError, StoreFuture, TokenLookup};

/// On-disk layout of the state file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub tokens: Vec<TokenRecord>,
}

/// Thread-safe state file manager.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Load the state file at `path`.
    ///
    /// If the file doesn't exist, creates it empty. The gateway then has no
    /// channels and every resolution fails with no available channel until
    /// channels are added.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::Io(format!("reading state file: {e}")))?;
            let state: StoreState = serde_json::from_str(&contents)
                .map_err(|e| StoreError::Parse(format!("parsing state file: {e}")))?;
            info!(
                path = %path.display(),
                channels = state.channels.len(),
                users = state.users.len(),
                tokens = state.tokens.len(),
                "loaded store state"
            );
            state
        } else {
            info!(path = %path.display(), "state file not found, starting with empty store");
            let state = StoreState::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Persist the current in-memory state to disk.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;
        write_atomic(&self.path, &state).await
    }

    /// Add or replace a channel and persist.
    pub async fn upsert_channel(&self, channel: Channel) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = channel.id;
        match state.channels.iter_mut().find(|c| c.id == id) {
            Some(existing) => *existing = channel,
            None => state.channels.push(channel),
        }
        debug!(channel_id = id, "upserted channel");
        write_atomic(&self.path, &state).await
    }

    /// Add or replace a user and persist.
    pub async fn upsert_user(&self, user: UserRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = user.id;
        match state.users.iter_mut().find(|u| u.id == id) {
            Some(existing) => *existing = user,
            None => state.users.push(user),
        }
        write_atomic(&self.path, &state).await
    }

    /// Add or replace a token and persist.
    pub async fn upsert_token(&self, token: TokenRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = token.id;
        match state.tokens.iter_mut().find(|t| t.id == id) {
            Some(existing) => *existing = token,
            None => state.tokens.push(token),
        }
        write_atomic(&self.path, &state).await
    }
}

impl ChannelStore for FileStore {
    fn list_channels(&self) -> StoreFuture<'_, Vec<Channel>> {
        Box::pin(async move { Ok(self.state.lock().await.channels.clone()) })
    }

    fn get_channel(&self, id: i64) -> StoreFuture<'_, Option<Channel>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.channels.iter().find(|c| c.id == id).cloned())
        })
    }

    fn update_status(&self, id: i64, status: ChannelStatus) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let channel = state
                .channels
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| StoreError::NotFound(format!("channel {id}")))?;
            if channel.status == status {
                return Ok(());
            }
            channel.status = status;
            debug!(channel_id = id, status = status.label(), "updated channel status");
            write_atomic(&self.path, &state).await
        })
    }
}

impl QuotaStore for FileStore {
    fn balance(&self, subject: SubjectKey) -> StoreFuture<'_, i64> {
        Box::pin(async move {
            let state = self.state.lock().await;
            match subject {
                SubjectKey::User(id) => state.users.iter().find(|u| u.id == id).map(|u| u.quota),
                SubjectKey::Token(id) => state
                    .tokens
                    .iter()
                    .find(|t| t.id == id)
                    .map(|t| t.remain_quota),
            }
            .ok_or_else(|| StoreError::NotFound(subject.to_string()))
        })
    }

    fn apply_delta(&self, subject: SubjectKey, delta: i64) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let balance = match subject {
                SubjectKey::User(id) => state
                    .users
                    .iter_mut()
                    .find(|u| u.id == id)
                    .map(|u| &mut u.quota),
                SubjectKey::Token(id) => state
                    .tokens
                    .iter_mut()
                    .find(|t| t.id == id)
                    .map(|t| &mut t.remain_quota),
            }
            .ok_or_else(|| StoreError::NotFound(subject.to_string()))?;
            *balance += delta;
            debug!(subject = %subject, delta, "applied quota delta");
            write_atomic(&self.path, &state).await
        })
    }
}

impl TokenLookup for FileStore {
    fn token_by_key<'a>(
        &'a self,
        key: &'a str,
    ) -> StoreFuture<'a, Option<(TokenRecord, UserRecord)>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let Some(token) = state
                .tokens
                .iter()
                .find(|t| t.enabled && t.key.expose() == key)
            else {
                return Ok(None);
            };
            let user = state
                .users
                .iter()
                .find(|u| u.id == token.user_id)
                .ok_or_else(|| {
                    StoreError::NotFound(format!("user {} of token {}", token.user_id, token.id))
                })?;
            Ok(Some((token.clone(), user.clone())))
        })
    }
}

/// Write the state to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. The file holds channel credentials and token keys, so it is
/// created with 0600 permissions.
async fn write_atomic(path: &Path, state: &StoreState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| StoreError::Parse(format!("serializing state: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Io("state path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".gateway-state.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| StoreError::Io(format!("writing temp state file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| StoreError::Io(format!("setting state file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StoreError::Io(format!("renaming temp state file: {e}")))?;

    debug!(path = %path.display(), "persisted store state");
    Ok(())
}
