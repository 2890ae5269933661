//! Ceph storage backend.
//!
//! [`Backend`] is the seam between the volume state machine and the storage cluster. The
//! production implementation, [`CephCli`], shells out to `rbd` and `ceph`.

pub mod cli;
pub mod conf;

pub use cli::CephCli;
pub use conf::CephConfFiles;

use anyhow::Result;
use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::collections::HashMap;

use crate::csi::options::VolumeOptions;
use crate::storage::models::{Credentials, VolumeRecord};

/// Secrets passed along with controller RPCs, keyed by Ceph user ID.
pub type Secrets = HashMap<String, String>;

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Whether an image named `volume.vol_name` exists in `volume`'s pool.
    async fn image_exists(&self, volume: &VolumeRecord, secrets: &Secrets) -> Result<bool>;

    async fn create_image(&self, volume: &VolumeRecord, size_gib: i64, secrets: &Secrets)
    -> Result<()>;

    async fn delete_image(&self, volume: &VolumeRecord, secrets: &Secrets) -> Result<()>;

    /// Create (or fetch) the dedicated principal of a provisioned volume.
    async fn create_user(
        &self,
        volume_id: &str,
        options: &VolumeOptions,
        admin: &Credentials,
    ) -> Result<Credentials>;

    async fn delete_user(
        &self,
        volume_id: &str,
        options: &VolumeOptions,
        admin: &Credentials,
    ) -> Result<()>;
}

/// Name of the dedicated Ceph user owned by a provisioned volume.
pub fn user_name(volume_id: &str) -> String {
    format!("csi-user-{}", volume_id)
}
