use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Output;
use tokio::process::Command;

use super::{Backend, Secrets, user_name};
use crate::config::CephConfig;
use crate::csi::options::{PROVISIONED_VOLUMES_ROOT, VolumeOptions};
use crate::storage::models::{Credentials, VolumeRecord};

/// Drives the cluster through the `rbd` and `ceph` command line tools.
#[derive(Debug, Clone)]
pub struct CephCli {
    rbd_bin: String,
    ceph_bin: String,
}

#[derive(Debug, Deserialize)]
struct AuthEntity {
    entity: String,
    key: String,
}

impl CephCli {
    pub fn new(config: &CephConfig) -> Self {
        Self { rbd_bin: config.rbd_bin.clone(), ceph_bin: config.ceph_bin.clone() }
    }

    fn admin_key<'a>(volume: &VolumeRecord, secrets: &'a Secrets) -> Result<&'a str> {
        secrets
            .get(&volume.parameters.admin_id)
            .map(String::as_str)
            .with_context(|| format!("no key for ceph user {} in secrets", volume.parameters.admin_id))
    }

    fn image_spec(volume: &VolumeRecord) -> String {
        format!("{}/{}", volume.parameters.pool, volume.vol_name)
    }

    fn connection_args(monitors: &str, id: &str, key: &str) -> Vec<String> {
        vec![
            "-m".to_string(),
            monitors.to_string(),
            "--id".to_string(),
            id.to_string(),
            format!("--key={}", key),
        ]
    }

    /// Run a tool and return its raw output. Arguments may carry keys, so only the
    /// subcommand ends up in logs and errors.
    async fn exec(&self, program: &str, args: &[String]) -> Result<Output> {
        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        tracing::debug!(program, subcommand, "Running ceph tool");

        Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", program, subcommand))
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let output = self.exec(program, args).await?;
        if !output.status.success() {
            bail!(
                "{} {} failed ({}): {}",
                program,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

fn is_not_found(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr.contains("No such file or directory") || stderr.contains("does not exist")
}

#[async_trait]
impl Backend for CephCli {
    async fn image_exists(&self, volume: &VolumeRecord, secrets: &Secrets) -> Result<bool> {
        let key = Self::admin_key(volume, secrets)?;
        let mut args = vec!["info".to_string(), Self::image_spec(volume)];
        args.extend(Self::connection_args(
            &volume.parameters.monitors,
            &volume.parameters.admin_id,
            key,
        ));

        let output = self.exec(&self.rbd_bin, &args).await?;
        if output.status.success() {
            return Ok(true);
        }
        if is_not_found(&output) {
            return Ok(false);
        }
        bail!(
            "rbd info {} failed ({}): {}",
            Self::image_spec(volume),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }

    async fn create_image(&self, volume: &VolumeRecord, size_gib: i64, secrets: &Secrets) -> Result<()> {
        let key = Self::admin_key(volume, secrets)?;
        let mut args = vec![
            "create".to_string(),
            Self::image_spec(volume),
            "--size".to_string(),
            format!("{}G", size_gib),
            "--image-format".to_string(),
            volume.parameters.image_format.clone(),
        ];
        if let Some(features) = &volume.parameters.image_features {
            args.push("--image-feature".to_string());
            args.push(features.clone());
        }
        args.extend(Self::connection_args(
            &volume.parameters.monitors,
            &volume.parameters.admin_id,
            key,
        ));

        self.run(&self.rbd_bin, &args).await?;
        tracing::info!(image = %Self::image_spec(volume), size_gib, "Created rbd image");
        Ok(())
    }

    async fn delete_image(&self, volume: &VolumeRecord, secrets: &Secrets) -> Result<()> {
        let key = Self::admin_key(volume, secrets)?;
        let mut args = vec!["rm".to_string(), Self::image_spec(volume)];
        args.extend(Self::connection_args(
            &volume.parameters.monitors,
            &volume.parameters.admin_id,
            key,
        ));

        let output = self.exec(&self.rbd_bin, &args).await?;
        if output.status.success() {
            tracing::info!(image = %Self::image_spec(volume), "Deleted rbd image");
            return Ok(());
        }
        if is_not_found(&output) {
            tracing::warn!(image = %Self::image_spec(volume), "rbd image already gone");
            return Ok(());
        }
        bail!(
            "rbd rm {} failed ({}): {}",
            Self::image_spec(volume),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }

    async fn create_user(
        &self,
        volume_id: &str,
        options: &VolumeOptions,
        admin: &Credentials,
    ) -> Result<Credentials> {
        let pool = options.pool.as_deref().context("provisioned volume has no pool")?;
        let entity = format!("client.{}", user_name(volume_id));

        let mut args = vec![
            "auth".to_string(),
            "get-or-create".to_string(),
            entity.clone(),
            "mds".to_string(),
            format!("allow rw path={}/{}", PROVISIONED_VOLUMES_ROOT, volume_id),
            "mon".to_string(),
            "allow r".to_string(),
            "osd".to_string(),
            format!("allow rw pool={} namespace={}", pool, VolumeOptions::namespace(volume_id)),
            "-f".to_string(),
            "json".to_string(),
        ];
        args.extend(Self::connection_args(&options.monitors, &admin.id, &admin.key));

        let stdout = self.run(&self.ceph_bin, &args).await?;
        let entities: Vec<AuthEntity> =
            serde_json::from_slice(&stdout).context("Failed to parse ceph auth output")?;
        let created = entities
            .into_iter()
            .find(|e| e.entity == entity)
            .with_context(|| format!("ceph auth output does not contain {}", entity))?;

        tracing::info!(volume_id, user = %created.entity, "Created dedicated ceph user");

        let id = created.entity.strip_prefix("client.").unwrap_or(&created.entity).to_string();
        Ok(Credentials::new(id, created.key))
    }

    async fn delete_user(
        &self,
        volume_id: &str,
        options: &VolumeOptions,
        admin: &Credentials,
    ) -> Result<()> {
        let entity = format!("client.{}", user_name(volume_id));
        let mut args = vec!["auth".to_string(), "del".to_string(), entity.clone()];
        args.extend(Self::connection_args(&options.monitors, &admin.id, &admin.key));

        let output = self.exec(&self.ceph_bin, &args).await?;
        if output.status.success() || is_not_found(&output) {
            tracing::info!(volume_id, user = %entity, "Deleted dedicated ceph user");
            return Ok(());
        }
        bail!(
            "ceph auth del {} failed ({}): {}",
            entity,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }
}
