//! Mount operations used by the node service.

pub mod system;

pub use system::SystemMounter;

use anyhow::Result;
use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::path::{Path, PathBuf};

use crate::csi::options::VolumeOptions;
use crate::storage::models::Credentials;

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount the volume's filesystem root at `target` with the given client identity.
    async fn mount(
        &self,
        target: &Path,
        credentials: &Credentials,
        options: &VolumeOptions,
        volume_id: &str,
    ) -> Result<()>;

    /// On error `target` is left unmounted.
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()>;

    async fn unmount(&self, target: &Path) -> Result<()>;

    /// `false` for paths that do not exist.
    async fn is_mount_point(&self, path: &Path) -> Result<bool>;
}

/// Mount points listed in a `/proc/self/mounts` style table.
pub fn parse_mount_points(table: &str) -> Vec<PathBuf> {
    // <device> <mountpoint> <fstype> <options> <dump> <pass>
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Undo the octal escapes (`\040` for space) the kernel applies to mount table fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
