//! Channel registry: the published ability index plus the store behind it
//!
//! Readers take a snapshot with [`ChannelRegistry::snapshot`] and keep using
//! it for the whole resolution. Reloads and status flips publish a fresh
//! index atomically; nothing is ever mutated in place.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use channel::{ChannelStatus, ChannelStore};
use tracing::{debug, info};

use crate::ability::AbilityIndex;
use crate::error::{Error, Result};

pub struct ChannelRegistry {
    store: Arc<dyn ChannelStore>,
    index: ArcSwap<AbilityIndex>,
    store_timeout: Duration,
}

impl ChannelRegistry {
    /// Create a registry with an empty index. Call [`reload`](Self::reload)
    /// before routing.
    pub fn new(store: Arc<dyn ChannelStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            index: ArcSwap::from_pointee(AbilityIndex::default()),
            store_timeout,
        }
    }

    /// Rebuild the index from the store and publish it. On failure the
    /// previous index stays in place.
    pub async fn reload(&self) -> Result<usize> {
        let channels = tokio::time::timeout(self.store_timeout, self.store.list_channels())
            .await
            .map_err(|_| Error::StoreUnavailable("listing channels timed out".into()))??;

        let index = AbilityIndex::build(channels);
        let count = index.len();
        self.index.store(Arc::new(index));
        info!(channels = count, "ability index rebuilt");
        Ok(count)
    }

    /// Current index. Cheap; holds no lock.
    pub fn snapshot(&self) -> Arc<AbilityIndex> {
        self.index.load_full()
    }

    /// Persist a status change and publish an index reflecting it.
    ///
    /// The local index is updated even when persisting fails, so routing
    /// follows the in-memory decision; the store error is still returned.
    pub async fn set_status(&self, id: i64, status: ChannelStatus) -> Result<()> {
        let persisted =
            tokio::time::timeout(self.store_timeout, self.store.update_status(id, status))
                .await
                .map_err(|_| Error::StoreUnavailable(format!("updating channel {id} timed out")))
                .and_then(|r| r.map_err(Error::from));

        let changed = self
            .snapshot()
            .channel(id)
            .is_some_and(|c| c.status != status);
        if changed {
            self.index.rcu(|current| current.with_status(id, status));
            debug!(channel_id = id, status = status.label(), "channel status published");
        }
        persisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel::{Channel, FileStore};

    fn channel(id: i64) -> Channel {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("ch{id}"),
            "type": 1,
            "groups": ["default"],
            "models": ["gpt-4"],
            "keys": ["sk"],
        }))
        .unwrap()
    }

    async fn registry(dir: &tempfile::TempDir, ids: &[i64]) -> (Arc<FileStore>, ChannelRegistry) {
        let store = Arc::new(FileStore::load(dir.path().join("state.json")).await.unwrap());
        for id in ids {
            store.upsert_channel(channel(*id)).await.unwrap();
        }
        let registry = ChannelRegistry::new(store.clone(), Duration::from_secs(1));
        (store, registry)
    }

    #[tokio::test]
    async fn starts_empty_until_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, registry) = registry(&dir, &[1, 2]).await;
        assert!(registry.snapshot().is_empty());

        assert_eq!(registry.reload().await.unwrap(), 2);
        assert_eq!(registry.snapshot().candidates("default", "gpt-4").len(), 2);
    }

    #[tokio::test]
    async fn set_status_persists_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, registry) = registry(&dir, &[1, 2]).await;
        registry.reload().await.unwrap();
        let before = registry.snapshot();

        registry
            .set_status(1, ChannelStatus::ManuallyDisabled)
            .await
            .unwrap();

        let after = registry.snapshot();
        assert_eq!(after.candidates("default", "gpt-4").len(), 1);
        // Snapshots taken earlier are unaffected
        assert_eq!(before.candidates("default", "gpt-4").len(), 2);

        let stored = store.get_channel(1).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelStatus::ManuallyDisabled);
    }

    #[tokio::test]
    async fn unknown_channel_status_update_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, registry) = registry(&dir, &[1]).await;
        registry.reload().await.unwrap();

        let err = registry
            .set_status(99, ChannelStatus::AutoDisabled)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn reload_picks_up_new_channels() {
        let dir = tempfile::tempdir().unwrap();
        let (store, registry) = registry(&dir, &[1]).await;
        registry.reload().await.unwrap();

        store.upsert_channel(channel(2)).await.unwrap();
        assert_eq!(registry.snapshot().len(), 1);
        registry.reload().await.unwrap();
        assert_eq!(registry.snapshot().len(), 2);
    }
}
