use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::storage::file::validate_key;
use crate::storage::models::Credentials;

const SHARE_PREFIX: &str = "ceph.share";

/// Per-volume Ceph client files (`ceph.share.<volume>.*`) in the Ceph config directory.
#[derive(Debug, Clone)]
pub struct CephConfFiles {
    dir: PathBuf,
}

impl CephConfFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn conf_path(&self, volume_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.conf", SHARE_PREFIX, volume_id))
    }

    pub fn keyring_path(&self, volume_id: &str, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.client.{}.keyring", SHARE_PREFIX, volume_id, id))
    }

    pub fn secret_path(&self, volume_id: &str, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.client.{}.secret", SHARE_PREFIX, volume_id, id))
    }

    pub async fn write_conf(&self, volume_id: &str, monitors: &str) -> Result<PathBuf> {
        validate_key(volume_id)?;
        let path = self.conf_path(volume_id);
        let contents = format!("[global]\nmon_host = {}\nfuse_set_user_groups = false\n", monitors);
        self.write(&path, contents.as_bytes(), 0o644).await?;
        Ok(path)
    }

    pub async fn write_keyring(&self, volume_id: &str, credentials: &Credentials) -> Result<PathBuf> {
        validate_key(volume_id)?;
        validate_key(&credentials.id)?;
        let path = self.keyring_path(volume_id, &credentials.id);
        let contents = format!("[client.{}]\nkey = {}\n", credentials.id, credentials.key);
        self.write(&path, contents.as_bytes(), 0o600).await?;
        Ok(path)
    }

    pub async fn write_secret(&self, volume_id: &str, credentials: &Credentials) -> Result<PathBuf> {
        validate_key(volume_id)?;
        validate_key(&credentials.id)?;
        let path = self.secret_path(volume_id, &credentials.id);
        self.write(&path, credentials.key.as_bytes(), 0o600).await?;
        Ok(path)
    }

    /// Remove every client file belonging to the volume.
    pub async fn remove(&self, volume_id: &str) -> Result<()> {
        validate_key(volume_id)?;
        let prefix = format!("{}.{}.", SHARE_PREFIX, volume_id);

        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("Failed to read ceph config directory"),
        };

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // `ceph.share.<vol>.conf` also shares the prefix
            if name.starts_with(&prefix) {
                tokio::fs::remove_file(entry.path())
                    .await
                    .with_context(|| format!("Failed to remove {}", entry.path().display()))?;
            }
        }

        Ok(())
    }

    async fn write(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_conf() {
        let dir = tempfile::tempdir().unwrap();
        let files = CephConfFiles::new(dir.path());

        let path = files.write_conf("vol-1", "mon1:6789,mon2:6789").await.unwrap();
        assert_eq!(path, dir.path().join("ceph.share.vol-1.conf"));

        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("mon_host = mon1:6789,mon2:6789"));
    }

    #[tokio::test]
    async fn test_keyring_and_secret_are_private() {
        let dir = tempfile::tempdir().unwrap();
        let files = CephConfFiles::new(dir.path());
        let creds = Credentials::new("csi-user-vol-1", "AQBkey==");

        let keyring = files.write_keyring("vol-1", &creds).await.unwrap();
        let secret = files.write_secret("vol-1", &creds).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&keyring).unwrap(),
            "[client.csi-user-vol-1]\nkey = AQBkey==\n"
        );
        assert_eq!(std::fs::read_to_string(&secret).unwrap(), "AQBkey==");
        let mode = std::fs::metadata(&secret).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_remove_only_touches_own_volume() {
        let dir = tempfile::tempdir().unwrap();
        let files = CephConfFiles::new(dir.path());
        let creds = Credentials::new("admin", "AQBkey==");

        files.write_conf("vol-1", "mon1").await.unwrap();
        files.write_keyring("vol-1", &creds).await.unwrap();
        files.write_conf("vol-10", "mon1").await.unwrap();

        files.remove("vol-1").await.unwrap();

        assert!(!files.conf_path("vol-1").exists());
        assert!(!files.keyring_path("vol-1", "admin").exists());
        assert!(files.conf_path("vol-10").exists());
    }

    #[tokio::test]
    async fn test_rejects_bad_volume_id() {
        let dir = tempfile::tempdir().unwrap();
        let files = CephConfFiles::new(dir.path());
        assert!(files.write_conf("../escape", "mon1").await.is_err());
    }
}
