use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::storage::{VolumeRecord, VolumeRepository};

#[derive(Default)]
struct Index {
    by_id: HashMap<String, VolumeRecord>,
    by_name: HashMap<String, String>,
}

/// Controller's view of provisioned volumes: a durable repository plus an in-memory index
/// used for name lookups.
///
/// Writes go to the repository first, so the index never holds a record that was not
/// persisted.
pub struct VolumeMetadataStore {
    repo: Arc<dyn VolumeRepository>,
    index: RwLock<Index>,
}

impl VolumeMetadataStore {
    pub fn new(repo: Arc<dyn VolumeRepository>) -> Self {
        Self { repo, index: RwLock::new(Index::default()) }
    }

    /// Rebuild the index from the repository. Returns the number of records loaded.
    pub async fn recover(&self) -> Result<usize> {
        let records = self.repo.list().await.context("Failed to list volume records")?;

        let mut index = self.index.write().await;
        index.by_id.clear();
        index.by_name.clear();
        for record in records {
            if let Some(previous) = index.by_name.insert(record.vol_name.clone(), record.vol_id.clone())
            {
                tracing::warn!(
                    vol_name = %record.vol_name,
                    previous = %previous,
                    current = %record.vol_id,
                    "Duplicate volume name in metadata, keeping the later record"
                );
            }
            index.by_id.insert(record.vol_id.clone(), record);
        }

        tracing::info!(volumes = index.by_id.len(), "Recovered volume metadata");
        Ok(index.by_id.len())
    }

    pub async fn find_by_name(&self, name: &str) -> Option<VolumeRecord> {
        let index = self.index.read().await;
        index.by_name.get(name).and_then(|id| index.by_id.get(id)).cloned()
    }

    /// Look up by ID, falling back to the repository for records written by another replica.
    pub async fn get(&self, vol_id: &str) -> Result<Option<VolumeRecord>> {
        if let Some(record) = self.index.read().await.by_id.get(vol_id) {
            return Ok(Some(record.clone()));
        }
        self.repo.get(vol_id).await.with_context(|| format!("Failed to load volume {}", vol_id))
    }

    pub async fn insert(&self, record: VolumeRecord) -> Result<()> {
        self.repo
            .put(&record)
            .await
            .with_context(|| format!("Failed to persist volume {}", record.vol_id))?;

        let mut index = self.index.write().await;
        index.by_name.insert(record.vol_name.clone(), record.vol_id.clone());
        index.by_id.insert(record.vol_id.clone(), record);
        Ok(())
    }

    pub async fn remove(&self, vol_id: &str) -> Result<()> {
        self.repo
            .delete(vol_id)
            .await
            .with_context(|| format!("Failed to delete volume record {}", vol_id))?;

        let mut index = self.index.write().await;
        if let Some(record) = index.by_id.remove(vol_id) {
            if index.by_name.get(&record.vol_name).is_some_and(|id| id == vol_id) {
                index.by_name.remove(&record.vol_name);
            }
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::options::ImageParameters;
    use crate::storage::traits::MockVolumeRepository;
    use chrono::Utc;

    fn record(id: &str, name: &str) -> VolumeRecord {
        VolumeRecord {
            vol_id: id.to_string(),
            vol_name: name.to_string(),
            vol_size: 1 << 30,
            parameters: ImageParameters {
                monitors: "mon1".to_string(),
                pool: "rbd".to_string(),
                image_format: "2".to_string(),
                image_features: None,
                admin_id: "admin".to_string(),
                user_id: "admin".to_string(),
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_then_find_by_name() {
        let mut repo = MockVolumeRepository::new();
        repo.expect_put().times(1).returning(|_| Ok(()));

        let store = VolumeMetadataStore::new(Arc::new(repo));
        store.insert(record("csi-rbd-1", "pvc-1")).await.unwrap();

        let found = store.find_by_name("pvc-1").await.unwrap();
        assert_eq!(found.vol_id, "csi-rbd-1");
        assert!(store.find_by_name("pvc-2").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_index_untouched() {
        let mut repo = MockVolumeRepository::new();
        repo.expect_put().returning(|_| Err(anyhow::anyhow!("disk full")));

        let store = VolumeMetadataStore::new(Arc::new(repo));
        let err = store.insert(record("csi-rbd-1", "pvc-1")).await.unwrap_err();

        assert!(format!("{:#}", err).contains("disk full"));
        assert!(store.find_by_name("pvc-1").await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_clears_both_indexes() {
        let mut repo = MockVolumeRepository::new();
        repo.expect_put().returning(|_| Ok(()));
        repo.expect_delete().returning(|_| Ok(true));
        repo.expect_get().returning(|_| Ok(None));

        let store = VolumeMetadataStore::new(Arc::new(repo));
        store.insert(record("csi-rbd-1", "pvc-1")).await.unwrap();
        store.remove("csi-rbd-1").await.unwrap();

        assert!(store.find_by_name("pvc-1").await.is_none());
        assert!(store.get("csi-rbd-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_rebuilds_index() {
        let mut repo = MockVolumeRepository::new();
        repo.expect_list()
            .returning(|| Ok(vec![record("csi-rbd-1", "pvc-1"), record("csi-rbd-2", "pvc-2")]));

        let store = VolumeMetadataStore::new(Arc::new(repo));
        assert_eq!(store.recover().await.unwrap(), 2);
        assert_eq!(store.find_by_name("pvc-2").await.unwrap().vol_id, "csi-rbd-2");
    }

    #[tokio::test]
    async fn test_get_falls_back_to_repository() {
        let mut repo = MockVolumeRepository::new();
        repo.expect_get()
            .withf(|id| id == "csi-rbd-9")
            .returning(|_| Ok(Some(record("csi-rbd-9", "pvc-9"))));

        let store = VolumeMetadataStore::new(Arc::new(repo));
        let loaded = store.get("csi-rbd-9").await.unwrap().unwrap();
        assert_eq!(loaded.vol_name, "pvc-9");
    }
}
