use anyhow::Result;
use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use super::models::{Credentials, StageRecord, VolumeRecord};

/// Controller-scoped volume metadata, one record per volume ID.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait VolumeRepository: Send + Sync {
    async fn put(&self, record: &VolumeRecord) -> Result<()>;
    async fn get(&self, vol_id: &str) -> Result<Option<VolumeRecord>>;
    async fn list(&self) -> Result<Vec<VolumeRecord>>;
    async fn delete(&self, vol_id: &str) -> Result<bool>;
}

/// Node-scoped credential store keyed by volume ID.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn put_credentials(&self, volume_id: &str, credentials: &Credentials) -> Result<()>;
    async fn get_credentials(&self, volume_id: &str, id: &str) -> Result<Option<Credentials>>;

    async fn put_stage_record(&self, volume_id: &str, record: &StageRecord) -> Result<()>;
    async fn get_stage_record(&self, volume_id: &str) -> Result<Option<StageRecord>>;
    async fn delete_stage_record(&self, volume_id: &str) -> Result<bool>;

    /// Drop everything stored for the volume.
    async fn purge(&self, volume_id: &str) -> Result<()>;
}
