use crate::csi::proto::plugin_capability::{self, Service, service};
use crate::csi::proto::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
    identity_server::Identity,
};
use tonic::{Request, Response, Status};

pub const PLUGIN_NAME: &str = "csi-cephplugin";
const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Services advertised to the container orchestrator. Topology is not supported, so volumes are
/// reachable from every node.
const ADVERTISED_SERVICES: &[service::Type] = &[service::Type::ControllerService];

/// Identity service shared by the controller and node processes.
///
/// Storage classes and persistent volumes refer to the driver by `name`, so it must match the
/// provisioner configured in the cluster.
#[derive(Debug, Clone)]
pub struct IdentityService {
    name: String,
    version: String,
}

impl IdentityService {
    pub fn new() -> Self {
        Self::with_name(PLUGIN_NAME)
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self { name: name.into(), version: PLUGIN_VERSION.to_string() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        if self.name.is_empty() {
            return Err(Status::unavailable("driver name not configured"));
        }

        Ok(Response::new(GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let capabilities = ADVERTISED_SERVICES
            .iter()
            .map(|service| PluginCapability {
                r#type: Some(plugin_capability::Type::Service(Service { r#type: *service as i32 })),
            })
            .collect();

        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    // Nothing to check: the ceph tools are only exercised per request
    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[tokio::test]
    async fn test_plugin_info_reports_configured_name() {
        let service = IdentityService::with_name("csi-cephfsplugin");

        let info = service
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(info.name, "csi-cephfsplugin");
        assert_eq!(info.vendor_version, PLUGIN_VERSION);
        assert!(info.manifest.is_empty());
    }

    #[tokio::test]
    async fn test_empty_name_is_unavailable() {
        let status = IdentityService::with_name("")
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_only_controller_service_is_advertised() {
        let caps = IdentityService::new()
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;

        assert_eq!(
            caps,
            vec![PluginCapability {
                r#type: Some(plugin_capability::Type::Service(Service {
                    r#type: service::Type::ControllerService as i32,
                })),
            }]
        );
    }

    #[tokio::test]
    async fn test_probe_is_ready() {
        let probe = IdentityService::default()
            .probe(Request::new(ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(probe.ready, Some(true));
        assert_eq!(IdentityService::default().name(), PLUGIN_NAME);
    }
}
