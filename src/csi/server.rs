use crate::csi::proto::{
    controller_server::ControllerServer, identity_server::IdentityServer, node_server::NodeServer,
};
use crate::csi::{ControllerService, IdentityService, NodeService};
use anyhow::{Context, Result};
use axum::{Router, routing::get};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

/// CSI gRPC server
pub struct CsiServer;

impl CsiServer {
    /// Bind the `unix://` endpoint, replacing a stale socket left by a previous run.
    pub fn bind(endpoint: &str) -> Result<UnixListenerStream> {
        let path = endpoint.strip_prefix("unix://").context("Address must start with unix://")?;
        let path = Path::new(path);

        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove existing socket")?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }

        let uds = tokio::net::UnixListener::bind(path).context("Failed to bind Unix socket")?;
        Ok(UnixListenerStream::new(uds))
    }

    /// Serve controller service
    pub async fn serve_controller(
        identity: IdentityService,
        controller: ControllerService,
        endpoint: String,
    ) -> Result<()> {
        let incoming = Self::bind(&endpoint)?;
        tracing::info!("CSI Controller listening on {}", endpoint);

        Server::builder()
            .add_service(IdentityServer::new(identity))
            .add_service(ControllerServer::new(controller))
            .serve_with_incoming(incoming)
            .await
            .context("gRPC server error")
    }

    /// Serve node service
    pub async fn serve_node(
        identity: IdentityService,
        node: NodeService,
        endpoint: String,
    ) -> Result<()> {
        let incoming = Self::bind(&endpoint)?;
        tracing::info!("CSI Node listening on {}", endpoint);

        Server::builder()
            .add_service(IdentityServer::new(identity))
            .add_service(NodeServer::new(node))
            .serve_with_incoming(incoming)
            .await
            .context("gRPC server error")
    }

    /// Spawn the `/metrics` HTTP endpoint in the background.
    pub async fn serve_metrics(addr: &str, registry: Arc<Registry>) -> Result<()> {
        let addr: SocketAddr = addr.parse().with_context(|| format!("Invalid metrics address {}", addr))?;

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move { render(&registry) }
            }),
        );

        let listener = TcpListener::bind(addr).await.context("Failed to bind metrics address")?;
        tracing::info!("Metrics server listening on {}", addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });

        Ok(())
    }
}

fn render(registry: &Registry) -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
