use crate::ceph::CephConfFiles;
use crate::csi::credentials::CredentialManager;
use crate::csi::error::{CsiError, CsiResult};
use crate::csi::locks::VolumeLocks;
use crate::csi::metrics::CsiMetrics;
use crate::csi::node_cache::{NodeCache, NodeCacheEntry};
use crate::csi::options::VolumeOptions;
use crate::csi::proto::node_service_capability::{self, Rpc, rpc::Type};
use crate::csi::proto::{
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
    NodeGetInfoResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeServiceCapability, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse, node_server::Node,
};
use crate::mount::Mounter;
use anyhow::Context;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};

/// Node Service implementation
///
/// Stages volumes with per-volume credentials and bind mounts them into pods.
#[derive(Clone)]
pub struct NodeService {
    node_id: String,
    mounter: Arc<dyn Mounter>,
    credentials: Arc<CredentialManager>,
    cache: Arc<NodeCache>,
    conf: CephConfFiles,
    metrics: Arc<CsiMetrics>,
    locks: VolumeLocks,
}

impl NodeService {
    pub fn new(
        node_id: impl Into<String>,
        mounter: Arc<dyn Mounter>,
        credentials: Arc<CredentialManager>,
        cache: Arc<NodeCache>,
        conf: CephConfFiles,
        metrics: Arc<CsiMetrics>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            mounter,
            credentials,
            cache,
            conf,
            metrics,
            locks: VolumeLocks::new(),
        }
    }

    fn require<'a>(value: &'a str, what: &str) -> CsiResult<&'a str> {
        if value.is_empty() {
            return Err(CsiError::invalid_argument(format!("{} missing in request", what)));
        }
        Ok(value)
    }

    async fn refresh_gauges(&self) {
        self.metrics.staged_volumes.set(self.cache.len().await as f64);
    }

    /// Remove a directory left behind by an unmount. Failures are logged only.
    async fn remove_mount_dir(path: &Path) {
        match tokio::fs::remove_dir(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove directory"),
        }
    }

    async fn do_stage(&self, req: NodeStageVolumeRequest) -> CsiResult<NodeStageVolumeResponse> {
        let volume_id = Self::require(&req.volume_id, "Volume ID")?;
        Self::require(&req.staging_target_path, "Staging target path")?;
        if req.volume_capability.is_none() {
            return Err(CsiError::invalid_argument("Volume capability missing in request"));
        }

        let options = VolumeOptions::from_attributes(&req.volume_attributes)?;

        let _guard = self.locks.lock(volume_id).await;
        let staging = PathBuf::from(&req.staging_target_path);

        tokio::fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("Failed to create staging path {}", staging.display()))?;

        self.conf.write_conf(volume_id, &options.monitors).await?;

        if self.mounter.is_mount_point(&staging).await? {
            tracing::info!(volume_id, staging = %staging.display(), "Volume already staged");
            if let Err(e) = self.cache.restore(volume_id).await {
                tracing::warn!(volume_id, error = %e, "Failed to restore node cache entry");
            }
            return Ok(NodeStageVolumeResponse {});
        }

        let identity = self
            .credentials
            .resolve(volume_id, &options, &req.node_stage_secrets)
            .await?;

        // Recorded before the dedicated user exists, so unstage can always delete it
        self.cache
            .insert(volume_id, NodeCacheEntry::new(options.clone(), identity.admin_id()))
            .await?;

        let user = self.credentials.mount_credentials(volume_id, &options, identity).await?;

        self.mounter
            .mount(&staging, &user, &options, volume_id)
            .await
            .with_context(|| format!("Failed to mount volume {}", volume_id))?;

        self.refresh_gauges().await;
        tracing::info!(
            volume_id,
            staging = %staging.display(),
            provisioned = options.provision_volume,
            "Staged volume"
        );

        Ok(NodeStageVolumeResponse {})
    }

    async fn do_unstage(&self, req: NodeUnstageVolumeRequest) -> CsiResult<NodeUnstageVolumeResponse> {
        let volume_id = Self::require(&req.volume_id, "Volume ID")?;
        Self::require(&req.staging_target_path, "Staging target path")?;

        let _guard = self.locks.lock(volume_id).await;
        let staging = PathBuf::from(&req.staging_target_path);

        self.cache.check_unstage(volume_id).await.map_err(CsiError::internal)?;

        if self.mounter.is_mount_point(&staging).await? {
            self.mounter
                .unmount(&staging)
                .await
                .with_context(|| format!("Failed to unmount volume {}", volume_id))?;
        }
        Self::remove_mount_dir(&staging).await;

        let entry = self.cache.pop(volume_id).await?;

        if entry.options.provision_volume {
            let deleted = match entry.admin_id.as_deref() {
                Some(admin_id) => {
                    self.credentials.delete_dedicated_user(volume_id, &entry.options, admin_id).await
                }
                None => Err(anyhow::anyhow!("no admin ID recorded for volume {}", volume_id)),
            };

            if let Err(e) = deleted {
                self.cache.reinsert(volume_id, entry).await;
                return Err(e.context("Failed to clean up dedicated user").into());
            }
        }

        if let Err(e) = self.cache.forget(volume_id).await {
            tracing::warn!(volume_id, error = %e, "Failed to forget node cache entry");
        }
        if let Err(e) = self.credentials.purge(volume_id).await {
            tracing::warn!(volume_id, error = %e, "Failed to purge stored credentials");
        }
        if let Err(e) = self.conf.remove(volume_id).await {
            tracing::warn!(volume_id, error = %e, "Failed to remove ceph client files");
        }

        self.refresh_gauges().await;
        tracing::info!(volume_id, staging = %staging.display(), "Unstaged volume");

        Ok(NodeUnstageVolumeResponse {})
    }

    async fn do_publish(&self, req: NodePublishVolumeRequest) -> CsiResult<NodePublishVolumeResponse> {
        let volume_id = Self::require(&req.volume_id, "Volume ID")?;
        Self::require(&req.staging_target_path, "Staging target path")?;
        Self::require(&req.target_path, "Target path")?;
        if req.volume_capability.is_none() {
            return Err(CsiError::invalid_argument("Volume capability missing in request"));
        }

        let _guard = self.locks.lock(volume_id).await;
        let staging = PathBuf::from(&req.staging_target_path);
        let target = PathBuf::from(&req.target_path);

        let tracked = self.cache.restore(volume_id).await?;
        if !tracked && !self.mounter.is_mount_point(&staging).await? {
            return Err(CsiError::internal(format!("volume {} is not staged", volume_id)));
        }

        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("Failed to create target path {}", target.display()))?;

        if self.mounter.is_mount_point(&target).await? {
            tracing::info!(volume_id, target = %target.display(), "Volume already published");
        } else {
            self.mounter
                .bind_mount(&staging, &target, req.readonly)
                .await
                .with_context(|| format!("Failed to publish volume {}", volume_id))?;
        }

        if tracked {
            if self.cache.mark_published(volume_id, &target).await.unwrap_or(false) {
                self.metrics.published_targets.inc();
            }
        } else {
            tracing::warn!(volume_id, "Published a staged volume the node cache does not know");
        }

        tracing::info!(
            volume_id,
            target = %target.display(),
            read_only = req.readonly,
            "Published volume"
        );

        Ok(NodePublishVolumeResponse {})
    }

    async fn do_unpublish(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> CsiResult<NodeUnpublishVolumeResponse> {
        let volume_id = Self::require(&req.volume_id, "Volume ID")?;
        Self::require(&req.target_path, "Target path")?;

        let _guard = self.locks.lock(volume_id).await;
        let target = PathBuf::from(&req.target_path);

        if self.mounter.is_mount_point(&target).await? {
            self.mounter
                .unmount(&target)
                .await
                .with_context(|| format!("Failed to unpublish volume {}", volume_id))?;
        } else {
            tracing::debug!(volume_id, target = %target.display(), "Target not mounted");
        }
        Self::remove_mount_dir(&target).await;

        if self.cache.mark_unpublished(volume_id, &target).await {
            self.metrics.published_targets.dec();
        }

        tracing::info!(volume_id, target = %target.display(), "Unpublished volume");

        Ok(NodeUnpublishVolumeResponse {})
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_stage(request.into_inner()).await;
        self.metrics.finish("NodeStageVolume", started, result)
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_unstage(request.into_inner()).await;
        self.metrics.finish("NodeUnstageVolume", started, result)
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_publish(request.into_inner()).await;
        self.metrics.finish("NodePublishVolume", started, result)
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_unpublish(request.into_inner()).await;
        self.metrics.finish("NodeUnpublishVolume", started, result)
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![NodeServiceCapability {
                r#type: Some(node_service_capability::Type::Rpc(Rpc {
                    r#type: Type::StageUnstageVolume as i32,
                })),
            }],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse { node_id: self.node_id.clone(), max_volumes_per_node: 0 }))
    }
}
