use crate::ceph::Backend;
use crate::csi::error::{CsiError, CsiResult};
use crate::csi::metadata::VolumeMetadataStore;
use crate::csi::metrics::CsiMetrics;
use crate::csi::options::ImageParameters;
use crate::csi::proto::controller_service_capability::{self, Rpc, rpc::Type};
use crate::csi::proto::volume_capability::access_mode::Mode;
use crate::csi::proto::{
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerServiceCapability, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateVolumeRequest, CreateVolumeResponse,
    DeleteVolumeRequest, DeleteVolumeResponse, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume, VolumeCapability, controller_server::Controller,
};
use crate::csi::locks::VolumeLocks;
use crate::storage::VolumeRecord;
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};
use uuid::Uuid;

/// Prefix of every generated volume ID.
pub const VOLUME_ID_PREFIX: &str = "csi-rbd-";

const ONE_GIB: i64 = 1024 * 1024 * 1024;

/// Controller Service implementation
///
/// Provisions images and keeps the name to volume ID mapping. Attach and detach are no-ops.
#[derive(Clone)]
pub struct ControllerService {
    metadata: Arc<VolumeMetadataStore>,
    backend: Arc<dyn Backend>,
    metrics: Arc<CsiMetrics>,
    locks: VolumeLocks,
    capabilities: Vec<Type>,
}

impl ControllerService {
    pub fn new(
        metadata: Arc<VolumeMetadataStore>,
        backend: Arc<dyn Backend>,
        metrics: Arc<CsiMetrics>,
    ) -> Self {
        Self {
            metadata,
            backend,
            metrics,
            locks: VolumeLocks::new(),
            capabilities: vec![Type::CreateDeleteVolume],
        }
    }

    fn validate_capability(&self, capability: Type) -> CsiResult<()> {
        if self.capabilities.contains(&capability) {
            return Ok(());
        }
        Err(CsiError::invalid_argument(format!(
            "controller capability {} is not supported",
            capability.as_str_name()
        )))
    }

    fn name_key(name: &str) -> String {
        format!("name/{}", name)
    }

    fn id_key(volume_id: &str) -> String {
        format!("id/{}", volume_id)
    }

    fn volume_response(record: &VolumeRecord, req: CreateVolumeRequest) -> CreateVolumeResponse {
        CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: record.vol_size,
                id: record.vol_id.clone(),
                attributes: req.parameters,
            }),
        }
    }

    async fn do_create_volume(&self, req: CreateVolumeRequest) -> CsiResult<CreateVolumeResponse> {
        self.validate_capability(Type::CreateDeleteVolume)?;

        if req.name.is_empty() {
            return Err(CsiError::invalid_argument("Volume Name cannot be empty"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::invalid_argument("Volume Capabilities cannot be empty"));
        }

        let requested = req.capacity_range.as_ref().map(|r| r.required_bytes).unwrap_or(0);
        if requested < 0 {
            return Err(CsiError::invalid_argument("required_bytes cannot be negative"));
        }

        let _guard = self.locks.lock(&Self::name_key(&req.name)).await;

        if let Some(existing) = self.metadata.find_by_name(&req.name).await {
            if existing.vol_size >= requested {
                tracing::info!(
                    vol_name = %req.name,
                    vol_id = %existing.vol_id,
                    "Volume already exists, returning it"
                );
                return Ok(Self::volume_response(&existing, req));
            }
            return Err(CsiError::already_exists(format!(
                "Volume with the same name: {} but with different size already exist",
                req.name
            )));
        }

        let parameters = ImageParameters::from_parameters(&req.parameters)?;

        let record = VolumeRecord {
            vol_id: format!("{}{}", VOLUME_ID_PREFIX, Uuid::new_v4()),
            vol_name: req.name.clone(),
            vol_size: if requested > 0 { requested } else { ONE_GIB },
            parameters,
            created_at: Utc::now(),
        };
        let size_gib = record.size_gib().ok_or_else(|| {
            CsiError::invalid_argument(format!("required_bytes {} is too large", requested))
        })?;

        let secrets = &req.controller_create_secrets;
        let exists = self
            .backend
            .image_exists(&record, secrets)
            .await
            .with_context(|| format!("Failed to check status of image {}", record.vol_name))?;

        if exists {
            tracing::info!(
                vol_name = %record.vol_name,
                pool = %record.parameters.pool,
                "Image already present in pool, adopting it"
            );
        } else {
            self.backend
                .create_image(&record, size_gib, secrets)
                .await
                .with_context(|| format!("Failed to create image {}", record.vol_name))?;
        }

        self.metadata.insert(record.clone()).await?;
        self.metrics.volume_count.set(self.metadata.len().await as f64);

        tracing::info!(
            vol_name = %record.vol_name,
            vol_id = %record.vol_id,
            vol_size = record.vol_size,
            "Created volume"
        );

        Ok(Self::volume_response(&record, req))
    }

    async fn do_delete_volume(&self, req: DeleteVolumeRequest) -> CsiResult<DeleteVolumeResponse> {
        self.validate_capability(Type::CreateDeleteVolume)?;

        if req.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("Volume ID missing in request"));
        }

        let _id_guard = self.locks.lock(&Self::id_key(&req.volume_id)).await;

        let record = self.metadata.get(&req.volume_id).await?.ok_or_else(|| {
            CsiError::internal(format!("metadata of volume {} not found", req.volume_id))
        })?;
        // Creates only take the name lock, so this order cannot deadlock
        let _name_guard = self.locks.lock(&Self::name_key(&record.vol_name)).await;

        self.backend
            .delete_image(&record, &req.controller_delete_secrets)
            .await
            .with_context(|| format!("Failed to delete image {}", record.vol_name))?;

        self.metadata.remove(&record.vol_id).await?;
        self.metrics.volume_count.set(self.metadata.len().await as f64);

        tracing::info!(vol_id = %record.vol_id, vol_name = %record.vol_name, "Deleted volume");

        Ok(DeleteVolumeResponse {})
    }

    fn supports(capabilities: &[VolumeCapability]) -> bool {
        capabilities.iter().all(|cap| {
            cap.access_mode.as_ref().is_some_and(|mode| mode.mode == Mode::SingleNodeWriter as i32)
        })
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_create_volume(request.into_inner()).await;
        self.metrics.finish("CreateVolume", started, result)
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_delete_volume(request.into_inner()).await;
        self.metrics.finish("DeleteVolume", started, result)
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        // No attach step for ceph volumes
        Ok(Response::new(ControllerPublishVolumeResponse { publish_info: Default::default() }))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();

        if Self::supports(&req.volume_capabilities) {
            return Ok(Response::new(ValidateVolumeCapabilitiesResponse {
                supported: true,
                message: String::new(),
            }));
        }

        tracing::debug!(volume_id = %req.volume_id, "Unsupported access mode requested");
        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            supported: false,
            message: "only SINGLE_NODE_WRITER access mode is supported".to_string(),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = self
            .capabilities
            .iter()
            .map(|t| ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(Rpc { r#type: *t as i32 })),
            })
            .collect();

        Ok(Response::new(ControllerGetCapabilitiesResponse { capabilities }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceph::MockBackend;
    use crate::csi::proto::volume_capability::AccessMode;
    use crate::storage::FileVolumeRepository;

    fn capability(mode: Mode) -> VolumeCapability {
        VolumeCapability {
            access_type: None,
            access_mode: Some(AccessMode { mode: mode as i32 }),
        }
    }

    fn service(backend: MockBackend, dir: &std::path::Path) -> ControllerService {
        let repo = Arc::new(FileVolumeRepository::new(dir));
        ControllerService::new(
            Arc::new(VolumeMetadataStore::new(repo)),
            Arc::new(backend),
            Arc::new(CsiMetrics::unregistered().unwrap()),
        )
    }

    #[test]
    fn test_supports_single_node_writer_only() {
        assert!(ControllerService::supports(&[capability(Mode::SingleNodeWriter)]));
        assert!(!ControllerService::supports(&[
            capability(Mode::SingleNodeWriter),
            capability(Mode::MultiNodeMultiWriter),
        ]));
        assert!(!ControllerService::supports(&[VolumeCapability {
            access_type: None,
            access_mode: None,
        }]));
    }

    #[tokio::test]
    async fn test_get_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(MockBackend::new(), dir.path());

        let caps = svc
            .controller_get_capabilities(Request::new(ControllerGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;

        assert_eq!(caps.len(), 1);
        assert_eq!(
            caps[0].r#type,
            Some(controller_service_capability::Type::Rpc(Rpc {
                r#type: Type::CreateDeleteVolume as i32
            }))
        );
    }

    #[tokio::test]
    async fn test_unadvertised_capability_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut svc = service(MockBackend::new(), dir.path());
        svc.capabilities.clear();

        let err = svc.validate_capability(Type::CreateDeleteVolume).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn test_negative_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(MockBackend::new(), dir.path());

        let status = svc
            .create_volume(Request::new(CreateVolumeRequest {
                name: "pvc-1".to_string(),
                capacity_range: Some(crate::csi::proto::CapacityRange {
                    required_bytes: -1,
                    limit_bytes: 0,
                }),
                volume_capabilities: vec![capability(Mode::SingleNodeWriter)],
                ..Default::default()
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(svc.metrics.operation_errors.with_label_values(&["CreateVolume"]).get(), 1.0);
    }
}
