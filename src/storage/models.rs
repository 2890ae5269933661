use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::csi::options::{ImageParameters, VolumeOptions};

/// Durable provisioning facts of one volume, keyed by `vol_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub vol_id: String,
    pub vol_name: String,
    pub vol_size: i64,
    #[serde(flatten)]
    pub parameters: ImageParameters,
    pub created_at: DateTime<Utc>,
}

impl VolumeRecord {
    /// Image size in GiB, rounded up so the image is never smaller than requested.
    /// `None` when the rounding overflows.
    pub fn size_gib(&self) -> Option<i64> {
        const GIB: i64 = 1024 * 1024 * 1024;
        self.vol_size.checked_add(GIB - 1).map(|bytes| bytes / GIB)
    }
}

/// A Ceph principal and its secret key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub id: String,
    pub key: String,
}

impl Credentials {
    pub fn new(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self { id: id.into(), key: key.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("id", &self.id).field("key", &"<redacted>").finish()
    }
}

/// Persisted part of a node cache entry: enough to finish cleanup after a node restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub options: VolumeOptions,
    pub admin_id: Option<String>,
}
