use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::ceph::Backend;
use crate::csi::options::VolumeOptions;
use crate::storage::{CredentialRepository, Credentials};

pub const ADMIN_ID_KEY: &str = "adminID";
pub const ADMIN_KEY_KEY: &str = "adminKey";
pub const USER_ID_KEY: &str = "userID";
pub const USER_KEY_KEY: &str = "userKey";

fn from_secrets(secrets: &HashMap<String, String>, id_key: &str, key_key: &str) -> Result<Credentials> {
    let id = secrets
        .get(id_key)
        .filter(|v| !v.is_empty())
        .with_context(|| format!("missing {} in secrets", id_key))?;
    let key = secrets
        .get(key_key)
        .filter(|v| !v.is_empty())
        .with_context(|| format!("missing {} in secrets", key_key))?;
    Ok(Credentials::new(id.clone(), key.clone()))
}

pub fn admin_credentials(secrets: &HashMap<String, String>) -> Result<Credentials> {
    from_secrets(secrets, ADMIN_ID_KEY, ADMIN_KEY_KEY)
}

pub fn user_credentials(secrets: &HashMap<String, String>) -> Result<Credentials> {
    from_secrets(secrets, USER_ID_KEY, USER_KEY_KEY)
}

/// Identity taken from the stage secrets, before any dedicated user exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageIdentity {
    /// Provisioned volume: the admin creates and later deletes the dedicated user.
    Admin(Credentials),
    /// Pre-provisioned volume: mounted with the supplied user as-is.
    User(Credentials),
}

impl StageIdentity {
    pub fn admin_id(&self) -> Option<String> {
        match self {
            Self::Admin(admin) => Some(admin.id.clone()),
            Self::User(_) => None,
        }
    }
}

/// Resolves the identity a volume is mounted with and owns the lifecycle of dedicated users.
///
/// Staging is split in two so the caller can record the admin identity between
/// [`CredentialManager::resolve`] and [`CredentialManager::mount_credentials`]; a dedicated
/// user is never created without a record that allows unstage to delete it.
pub struct CredentialManager {
    backend: Arc<dyn Backend>,
    store: Arc<dyn CredentialRepository>,
}

impl CredentialManager {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<dyn CredentialRepository>) -> Self {
        Self { backend, store }
    }

    /// Pick the admin or user credentials out of the secrets and store them on the node.
    pub async fn resolve(
        &self,
        volume_id: &str,
        options: &VolumeOptions,
        secrets: &HashMap<String, String>,
    ) -> Result<StageIdentity> {
        if !options.provision_volume {
            let user = user_credentials(secrets)?;
            self.store
                .put_credentials(volume_id, &user)
                .await
                .context("Failed to store user credentials")?;
            return Ok(StageIdentity::User(user));
        }

        let admin = admin_credentials(secrets)?;
        self.store
            .put_credentials(volume_id, &admin)
            .await
            .context("Failed to store admin credentials")?;
        Ok(StageIdentity::Admin(admin))
    }

    /// Credentials to mount with: the supplied user, or a dedicated user created with the admin.
    pub async fn mount_credentials(
        &self,
        volume_id: &str,
        options: &VolumeOptions,
        identity: StageIdentity,
    ) -> Result<Credentials> {
        let admin = match identity {
            StageIdentity::User(user) => return Ok(user),
            StageIdentity::Admin(admin) => admin,
        };

        let user = self
            .backend
            .create_user(volume_id, options, &admin)
            .await
            .with_context(|| format!("Failed to create ceph user for volume {}", volume_id))?;

        self.store
            .put_credentials(volume_id, &user)
            .await
            .context("Failed to store dedicated user credentials")?;

        tracing::info!(volume_id, user = %user.id, admin = %admin.id, "Resolved dedicated user");

        Ok(user)
    }

    /// Delete the dedicated user of a provisioned volume using the admin credentials stored
    /// at stage time.
    pub async fn delete_dedicated_user(
        &self,
        volume_id: &str,
        options: &VolumeOptions,
        admin_id: &str,
    ) -> Result<()> {
        let admin = self
            .store
            .get_credentials(volume_id, admin_id)
            .await
            .context("Failed to load admin credentials")?
            .with_context(|| {
                format!("admin credentials {} for volume {} not found", admin_id, volume_id)
            })?;

        self.backend
            .delete_user(volume_id, options, &admin)
            .await
            .with_context(|| format!("Failed to delete ceph user for volume {}", volume_id))
    }

    /// Drop every stored credential of the volume.
    pub async fn purge(&self, volume_id: &str) -> Result<()> {
        self.store.purge(volume_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceph::MockBackend;
    use crate::csi::options::MounterKind;
    use crate::storage::FileCredentialRepository;

    fn secrets(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn options(provision_volume: bool) -> VolumeOptions {
        VolumeOptions {
            monitors: "mon1".to_string(),
            pool: provision_volume.then(|| "cephfs_data".to_string()),
            root_path: (!provision_volume).then(|| "/shared".to_string()),
            mounter: MounterKind::Kernel,
            provision_volume,
        }
    }

    #[test]
    fn test_admin_credentials_require_both_keys() {
        assert!(admin_credentials(&secrets(&[("adminID", "admin")])).is_err());
        let creds =
            admin_credentials(&secrets(&[("adminID", "admin"), ("adminKey", "AQB==")])).unwrap();
        assert_eq!(creds.id, "admin");
    }

    #[tokio::test]
    async fn test_pre_provisioned_uses_user_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialRepository::new(dir.path()));
        let mut backend = MockBackend::new();
        backend.expect_create_user().never();

        let manager = CredentialManager::new(Arc::new(backend), store.clone());
        let identity = manager
            .resolve(
                "vol-1",
                &options(false),
                &secrets(&[("userID", "alice"), ("userKey", "AQBalice==")]),
            )
            .await
            .unwrap();
        assert!(identity.admin_id().is_none());
        assert!(store.get_credentials("vol-1", "alice").await.unwrap().is_some());

        let user = manager.mount_credentials("vol-1", &options(false), identity).await.unwrap();
        assert_eq!(user.id, "alice");
    }

    #[tokio::test]
    async fn test_provisioned_creates_dedicated_user_and_keeps_admin() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialRepository::new(dir.path()));
        let mut backend = MockBackend::new();
        backend
            .expect_create_user()
            .withf(|vol, _, admin| vol == "vol-1" && admin.id == "admin")
            .times(1)
            .returning(|_, _, _| Ok(Credentials::new("csi-user-vol-1", "AQBuser==")));

        let manager = CredentialManager::new(Arc::new(backend), store.clone());
        let identity = manager
            .resolve(
                "vol-1",
                &options(true),
                &secrets(&[("adminID", "admin"), ("adminKey", "AQBadmin==")]),
            )
            .await
            .unwrap();
        assert_eq!(identity.admin_id().as_deref(), Some("admin"));

        // The admin is on disk before any user exists
        let admin = store.get_credentials("vol-1", "admin").await.unwrap().unwrap();
        assert_eq!(admin.key, "AQBadmin==");

        let user = manager.mount_credentials("vol-1", &options(true), identity).await.unwrap();
        assert_eq!(user.id, "csi-user-vol-1");
        assert!(store.get_credentials("vol-1", "csi-user-vol-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_dedicated_user_needs_stored_admin() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialRepository::new(dir.path()));
        let mut backend = MockBackend::new();
        backend
            .expect_delete_user()
            .withf(|vol, _, admin| vol == "vol-1" && admin.key == "AQBadmin==")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let manager = CredentialManager::new(Arc::new(backend), store.clone());

        let err = manager.delete_dedicated_user("vol-1", &options(true), "admin").await;
        assert!(err.is_err());

        store.put_credentials("vol-1", &Credentials::new("admin", "AQBadmin==")).await.unwrap();
        manager.delete_dedicated_user("vol-1", &options(true), "admin").await.unwrap();

        manager.purge("vol-1").await.unwrap();
        assert!(store.get_credentials("vol-1", "admin").await.unwrap().is_none());
    }
}
