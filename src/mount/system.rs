use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use nix::mount::MsFlags;
use std::io::ErrorKind;
use std::path::Path;
use tokio::process::Command;

use super::{Mounter, parse_mount_points};
use crate::ceph::CephConfFiles;
use crate::config::CephConfig;
use crate::csi::options::{MounterKind, VolumeOptions};
use crate::storage::models::Credentials;

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Mounts CephFS with the kernel client or `ceph-fuse`, and bind mounts through `mount(2)`.
pub struct SystemMounter {
    conf: CephConfFiles,
    ceph_fuse_bin: String,
}

impl SystemMounter {
    pub fn new(config: &CephConfig) -> Self {
        Self {
            conf: CephConfFiles::new(&config.config_dir),
            ceph_fuse_bin: config.ceph_fuse_bin.clone(),
        }
    }

    async fn mount_kernel(
        &self,
        target: &Path,
        credentials: &Credentials,
        options: &VolumeOptions,
        volume_id: &str,
    ) -> Result<()> {
        let secret = self.conf.write_secret(volume_id, credentials).await?;
        let source = format!("{}:{}", options.monitors, options.mount_root(volume_id));
        let mount_options = format!("name={},secretfile={}", credentials.id, secret.display());

        let output = Command::new("mount")
            .arg("-t")
            .arg("ceph")
            .arg(&source)
            .arg(target)
            .arg("-o")
            .arg(&mount_options)
            .output()
            .await
            .context("Failed to run mount")?;

        if !output.status.success() {
            bail!(
                "mount -t ceph {} failed ({}): {}",
                source,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn mount_fuse(
        &self,
        target: &Path,
        credentials: &Credentials,
        options: &VolumeOptions,
        volume_id: &str,
    ) -> Result<()> {
        let conf = self.conf.write_conf(volume_id, &options.monitors).await?;
        let keyring = self.conf.write_keyring(volume_id, credentials).await?;
        let root = options.mount_root(volume_id);

        let output = Command::new(&self.ceph_fuse_bin)
            .arg(target)
            .arg("-c")
            .arg(&conf)
            .arg("-n")
            .arg(format!("client.{}", credentials.id))
            .arg("--keyring")
            .arg(&keyring)
            .arg("-r")
            .arg(&root)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.ceph_fuse_bin))?;

        if !output.status.success() {
            bail!(
                "ceph-fuse {} failed ({}): {}",
                root,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Run the read-only remount of a fresh bind mount. A writable bind is never left behind: on
/// failure the bind is undone so a retry starts from an unmounted target.
fn remount_read_only(
    target: &Path,
    remount: impl FnOnce() -> nix::Result<()>,
    unmount: impl FnOnce() -> nix::Result<()>,
) -> Result<()> {
    let Err(e) = remount() else {
        return Ok(());
    };

    if let Err(undo) = unmount() {
        tracing::error!(
            target = %target.display(),
            error = %undo,
            "Failed to undo writable bind mount"
        );
    }
    Err(e).with_context(|| format!("Failed to remount {} read-only", target.display()))
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn mount(
        &self,
        target: &Path,
        credentials: &Credentials,
        options: &VolumeOptions,
        volume_id: &str,
    ) -> Result<()> {
        match options.mounter {
            MounterKind::Kernel => self.mount_kernel(target, credentials, options, volume_id).await?,
            MounterKind::Fuse => self.mount_fuse(target, credentials, options, volume_id).await?,
        }

        tracing::info!(
            volume_id,
            target = %target.display(),
            mounter = ?options.mounter,
            user = %credentials.id,
            "Mounted cephfs"
        );
        Ok(())
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        nix::mount::mount(Some(source), target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
            .with_context(|| {
                format!("Failed to bind mount {} on {}", source.display(), target.display())
            })?;

        // MS_RDONLY is ignored on the initial bind
        if read_only {
            remount_read_only(
                target,
                || {
                    nix::mount::mount(
                        None::<&str>,
                        target,
                        None::<&str>,
                        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                        None::<&str>,
                    )
                },
                || nix::mount::umount(target),
            )?;
        }

        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            read_only,
            "Bind mounted"
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        nix::mount::umount(target)
            .with_context(|| format!("Failed to unmount {}", target.display()))?;
        tracing::debug!(target = %target.display(), "Unmounted");
        Ok(())
    }

    async fn is_mount_point(&self, path: &Path) -> Result<bool> {
        let path = match tokio::fs::canonicalize(path).await {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to resolve {}", path.display()));
            }
        };

        let table = tokio::fs::read_to_string(MOUNT_TABLE)
            .await
            .with_context(|| format!("Failed to read {}", MOUNT_TABLE))?;

        Ok(parse_mount_points(&table).iter().any(|p| *p == path))
    }
}
