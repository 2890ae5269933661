//! JSON-file repositories.
//!
//! Layout under the controller directory:
//!
//! ```text
//! <root>/<vol_id>.json
//! ```
//!
//! and under the node directory:
//!
//! ```text
//! <root>/<volume_id>/client.<id>.json
//! <root>/<volume_id>/stage.json
//! ```
//!
//! Every write goes to a sibling temp file first and is renamed into place, so a reader never
//! observes a half-written record.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::models::{Credentials, StageRecord, VolumeRecord};
use super::traits::{CredentialRepository, VolumeRepository};

const JSON_EXT: &str = "json";
const STAGE_FILE: &str = "stage.json";
const RECORD_MODE: u32 = 0o600;

/// Reject keys that would escape the store directory.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0')
    {
        bail!("invalid storage key {:?}", key);
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn write<T: Serialize + Sync>(&self, rel: &Path, value: &T) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let data = serde_json::to_vec_pretty(value).context("Failed to encode record")?;
        let tmp = path.with_extension("json.tmp");
        // Records may carry ceph keys
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(RECORD_MODE)
            .open(&tmp)
            .await
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&data)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all().await.with_context(|| format!("Failed to sync {}", tmp.display()))?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move record into {}", path.display()))?;

        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, rel: &Path) -> Result<Option<T>> {
        let path = self.root.join(rel);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        let value = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to decode {}", path.display()))?;
        Ok(Some(value))
    }

    async fn remove(&self, rel: &Path) -> Result<bool> {
        let path = self.root.join(rel);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    async fn remove_dir(&self, rel: &Path) -> Result<()> {
        let path = self.root.join(rel);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Decode every `*.json` file directly under the root; unreadable files are skipped.
    async fn list<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read directory {}", self.root.display()));
            }
        };

        let mut values = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JSON_EXT) {
                continue;
            }

            let Some(rel) = path.file_name().map(PathBuf::from) else {
                continue;
            };
            match self.read::<T>(&rel).await {
                Ok(Some(value)) => values.push(value),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                }
            }
        }

        Ok(values)
    }
}

/// Controller volume records stored as one JSON file per volume.
#[derive(Debug, Clone)]
pub struct FileVolumeRepository {
    store: JsonStore,
}

impl FileVolumeRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { store: JsonStore::new(root) }
    }

    fn record_path(vol_id: &str) -> Result<PathBuf> {
        validate_key(vol_id)?;
        Ok(PathBuf::from(format!("{}.{}", vol_id, JSON_EXT)))
    }
}

#[async_trait]
impl VolumeRepository for FileVolumeRepository {
    async fn put(&self, record: &VolumeRecord) -> Result<()> {
        self.store.write(&Self::record_path(&record.vol_id)?, record).await
    }

    async fn get(&self, vol_id: &str) -> Result<Option<VolumeRecord>> {
        self.store.read(&Self::record_path(vol_id)?).await
    }

    async fn list(&self) -> Result<Vec<VolumeRecord>> {
        self.store.list().await
    }

    async fn delete(&self, vol_id: &str) -> Result<bool> {
        self.store.remove(&Self::record_path(vol_id)?).await
    }
}

/// Node credentials and stage records, one directory per volume.
#[derive(Debug, Clone)]
pub struct FileCredentialRepository {
    store: JsonStore,
}

impl FileCredentialRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { store: JsonStore::new(root) }
    }

    fn volume_dir(volume_id: &str) -> Result<PathBuf> {
        validate_key(volume_id)?;
        Ok(PathBuf::from(volume_id))
    }

    fn credentials_path(volume_id: &str, id: &str) -> Result<PathBuf> {
        validate_key(id)?;
        Ok(Self::volume_dir(volume_id)?.join(format!("client.{}.{}", id, JSON_EXT)))
    }

    fn stage_path(volume_id: &str) -> Result<PathBuf> {
        Ok(Self::volume_dir(volume_id)?.join(STAGE_FILE))
    }
}

#[async_trait]
impl CredentialRepository for FileCredentialRepository {
    async fn put_credentials(&self, volume_id: &str, credentials: &Credentials) -> Result<()> {
        self.store.write(&Self::credentials_path(volume_id, &credentials.id)?, credentials).await
    }

    async fn get_credentials(&self, volume_id: &str, id: &str) -> Result<Option<Credentials>> {
        self.store.read(&Self::credentials_path(volume_id, id)?).await
    }

    async fn put_stage_record(&self, volume_id: &str, record: &StageRecord) -> Result<()> {
        self.store.write(&Self::stage_path(volume_id)?, record).await
    }

    async fn get_stage_record(&self, volume_id: &str) -> Result<Option<StageRecord>> {
        self.store.read(&Self::stage_path(volume_id)?).await
    }

    async fn delete_stage_record(&self, volume_id: &str) -> Result<bool> {
        self.store.remove(&Self::stage_path(volume_id)?).await
    }

    async fn purge(&self, volume_id: &str) -> Result<()> {
        self.store.remove_dir(&Self::volume_dir(volume_id)?).await
    }
}
