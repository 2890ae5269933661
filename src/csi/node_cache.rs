use anyhow::{Context, Result, anyhow};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::csi::options::VolumeOptions;
use crate::storage::{CredentialRepository, StageRecord};

/// Lifecycle of a volume on this node once it has been staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeState {
    Staged,
    Published(BTreeSet<PathBuf>),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("volume {0} is not staged on this node")]
    NotStaged(String),

    #[error("volume {volume_id} is still published at {targets}")]
    StillPublished { volume_id: String, targets: String },
}

/// What the node remembers about a staged volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCacheEntry {
    pub options: VolumeOptions,
    /// Admin identity recorded for provisioned volumes, used to delete the dedicated user.
    pub admin_id: Option<String>,
    pub state: VolumeState,
}

impl NodeCacheEntry {
    pub fn new(options: VolumeOptions, admin_id: Option<String>) -> Self {
        Self { options, admin_id, state: VolumeState::Staged }
    }

    pub fn targets(&self) -> Vec<PathBuf> {
        match &self.state {
            VolumeState::Staged => Vec::new(),
            VolumeState::Published(targets) => targets.iter().cloned().collect(),
        }
    }

    fn publish(&mut self, target: &Path) -> bool {
        if let VolumeState::Published(targets) = &mut self.state {
            return targets.insert(target.to_path_buf());
        }
        self.state = VolumeState::Published(BTreeSet::from([target.to_path_buf()]));
        true
    }

    fn unpublish(&mut self, target: &Path) -> bool {
        let VolumeState::Published(targets) = &mut self.state else {
            return false;
        };
        let removed = targets.remove(target);
        if targets.is_empty() {
            self.state = VolumeState::Staged;
        }
        removed
    }

    fn to_record(&self) -> StageRecord {
        StageRecord { options: self.options.clone(), admin_id: self.admin_id.clone() }
    }

    fn from_record(record: StageRecord) -> Self {
        Self::new(record.options, record.admin_id)
    }
}

/// Per-node map from volume ID to [`NodeCacheEntry`].
///
/// With a store attached, the staged part of each entry is persisted so that unstage can
/// still find the admin identity after the plugin restarts.
#[derive(Default)]
pub struct NodeCache {
    entries: RwLock<HashMap<String, NodeCacheEntry>>,
    store: Option<Arc<dyn CredentialRepository>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: Arc<dyn CredentialRepository>) -> Self {
        Self { entries: RwLock::new(HashMap::new()), store: Some(store) }
    }

    pub async fn insert(&self, volume_id: &str, entry: NodeCacheEntry) -> Result<()> {
        if let Some(store) = &self.store {
            store
                .put_stage_record(volume_id, &entry.to_record())
                .await
                .with_context(|| format!("Failed to persist stage record of {}", volume_id))?;
        }
        self.entries.write().await.insert(volume_id.to_string(), entry);
        Ok(())
    }

    pub async fn get(&self, volume_id: &str) -> Option<NodeCacheEntry> {
        self.entries.read().await.get(volume_id).cloned()
    }

    pub async fn contains(&self, volume_id: &str) -> bool {
        self.entries.read().await.contains_key(volume_id)
    }

    /// Load a persisted entry back into memory. Returns whether the volume is now known.
    pub async fn restore(&self, volume_id: &str) -> Result<bool> {
        if self.contains(volume_id).await {
            return Ok(true);
        }
        let Some(entry) = self.load(volume_id).await? else {
            return Ok(false);
        };

        tracing::info!(volume_id, "Restored node cache entry from disk");
        self.entries.write().await.entry(volume_id.to_string()).or_insert(entry);
        Ok(true)
    }

    /// Take the entry out of memory, or out of the store when memory has none.
    ///
    /// The persisted record stays until [`NodeCache::forget`], so a failed cleanup can
    /// [`NodeCache::reinsert`] the entry and be retried.
    pub async fn pop(&self, volume_id: &str) -> Result<NodeCacheEntry> {
        if let Some(entry) = self.entries.write().await.remove(volume_id) {
            return Ok(entry);
        }
        self.load(volume_id)
            .await?
            .ok_or_else(|| anyhow!("node cache entry for volume {} not found", volume_id))
    }

    pub async fn reinsert(&self, volume_id: &str, entry: NodeCacheEntry) {
        self.entries.write().await.insert(volume_id.to_string(), entry);
    }

    /// Drop the persisted record of a volume whose cleanup has finished.
    pub async fn forget(&self, volume_id: &str) -> Result<()> {
        if let Some(store) = &self.store {
            store
                .delete_stage_record(volume_id)
                .await
                .with_context(|| format!("Failed to delete stage record of {}", volume_id))?;
        }
        Ok(())
    }

    /// Staged or Published to Published. Returns `false` if `target` was already recorded.
    pub async fn mark_published(&self, volume_id: &str, target: &Path) -> Result<bool, TransitionError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(volume_id)
            .ok_or_else(|| TransitionError::NotStaged(volume_id.to_string()))?;
        Ok(entry.publish(target))
    }

    /// Drop `target` from the published set. Returns whether anything changed.
    pub async fn mark_unpublished(&self, volume_id: &str, target: &Path) -> bool {
        let mut entries = self.entries.write().await;
        entries.get_mut(volume_id).is_some_and(|entry| entry.unpublish(target))
    }

    /// Unstage is only allowed from the Staged state.
    pub async fn check_unstage(&self, volume_id: &str) -> Result<(), TransitionError> {
        let entries = self.entries.read().await;
        match entries.get(volume_id).map(|e| &e.state) {
            Some(VolumeState::Published(targets)) if !targets.is_empty() => {
                Err(TransitionError::StillPublished {
                    volume_id: volume_id.to_string(),
                    targets: targets
                        .iter()
                        .map(|t| t.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                })
            }
            _ => Ok(()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn load(&self, volume_id: &str) -> Result<Option<NodeCacheEntry>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let record = store
            .get_stage_record(volume_id)
            .await
            .with_context(|| format!("Failed to read stage record of {}", volume_id))?;
        Ok(record.map(NodeCacheEntry::from_record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::options::MounterKind;
    use crate::storage::FileCredentialRepository;

    fn options() -> VolumeOptions {
        VolumeOptions {
            monitors: "mon1".to_string(),
            pool: Some("cephfs_data".to_string()),
            root_path: None,
            mounter: MounterKind::Kernel,
            provision_volume: true,
        }
    }

    #[tokio::test]
    async fn test_pop_missing_entry_fails() {
        let cache = NodeCache::new();
        let err = cache.pop("vol-1").await.unwrap_err();
        assert!(err.to_string().contains("vol-1"));
    }

    #[tokio::test]
    async fn test_pop_and_reinsert() {
        let cache = NodeCache::new();
        let entry = NodeCacheEntry::new(options(), Some("admin".to_string()));
        cache.insert("vol-1", entry.clone()).await.unwrap();

        let popped = cache.pop("vol-1").await.unwrap();
        assert_eq!(popped, entry);
        assert!(!cache.contains("vol-1").await);

        cache.reinsert("vol-1", popped).await;
        assert_eq!(cache.get("vol-1").await.unwrap().admin_id.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_publish_transitions() {
        let cache = NodeCache::new();
        let t1 = Path::new("/pods/a/vol");
        let t2 = Path::new("/pods/b/vol");

        assert_eq!(
            cache.mark_published("vol-1", t1).await,
            Err(TransitionError::NotStaged("vol-1".to_string()))
        );

        cache.insert("vol-1", NodeCacheEntry::new(options(), None)).await.unwrap();
        assert_eq!(cache.mark_published("vol-1", t1).await, Ok(true));
        assert_eq!(cache.mark_published("vol-1", t1).await, Ok(false));
        assert_eq!(cache.mark_published("vol-1", t2).await, Ok(true));

        assert!(matches!(
            cache.check_unstage("vol-1").await,
            Err(TransitionError::StillPublished { .. })
        ));

        assert!(cache.mark_unpublished("vol-1", t1).await);
        assert!(!cache.mark_unpublished("vol-1", t1).await);
        assert!(cache.mark_unpublished("vol-1", t2).await);

        assert_eq!(cache.get("vol-1").await.unwrap().state, VolumeState::Staged);
        assert!(cache.check_unstage("vol-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_persisted_entry_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CredentialRepository> =
            Arc::new(FileCredentialRepository::new(dir.path()));

        let cache = NodeCache::with_store(store.clone());
        cache
            .insert("vol-1", NodeCacheEntry::new(options(), Some("admin".to_string())))
            .await
            .unwrap();

        let restarted = NodeCache::with_store(store.clone());
        assert!(restarted.is_empty().await);

        let entry = restarted.pop("vol-1").await.unwrap();
        assert_eq!(entry.admin_id.as_deref(), Some("admin"));
        assert_eq!(entry.state, VolumeState::Staged);

        restarted.forget("vol-1").await.unwrap();
        assert!(restarted.pop("vol-1").await.is_err());
    }

    #[tokio::test]
    async fn test_restore_loads_into_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CredentialRepository> =
            Arc::new(FileCredentialRepository::new(dir.path()));

        NodeCache::with_store(store.clone())
            .insert("vol-1", NodeCacheEntry::new(options(), None))
            .await
            .unwrap();

        let restarted = NodeCache::with_store(store);
        assert!(restarted.restore("vol-1").await.unwrap());
        assert!(restarted.contains("vol-1").await);
        assert!(!restarted.restore("vol-2").await.unwrap());
    }
}
