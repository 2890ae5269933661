use anyhow::Context;
use cephcsi::ceph::{Backend, CephCli, CephConfFiles};
use cephcsi::config::{Config, MetadataBackend};
use cephcsi::csi::{
    ControllerService, CredentialManager, CsiMetrics, CsiServer, IdentityService, NodeCache,
    NodeService, VolumeMetadataStore,
};
use cephcsi::mount::SystemMounter;
use cephcsi::storage::{
    CredentialRepository, DatabasePool, FileCredentialRepository, FileVolumeRepository,
    PgVolumeRepository, VolumeRepository,
};
use clap::{Parser, Subcommand};
use prometheus::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[clap(author, version, about = "Ceph CSI driver", long_about = None)]
struct Cli {
    /// Config file; `cephcsi.toml` in the working directory is used when present
    #[clap(long, env = "CEPHCSI_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// CSI endpoint, e.g. unix:///csi/csi.sock
    #[clap(long, env = "CSI_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Driver name reported by GetPluginInfo
    #[clap(long = "drivername", env = "CSI_DRIVER_NAME", global = true)]
    driver_name: Option<String>,

    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Run the controller service
    Controller,
    /// Run the node service
    Node {
        /// Node ID reported by NodeGetInfo
        #[clap(long = "nodeid", env = "NODE_ID")]
        node_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cephcsi=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(endpoint) = cli.endpoint {
        config.driver.endpoint = endpoint;
    }
    if let Some(name) = cli.driver_name {
        config.driver.name = name;
    }


    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(CsiMetrics::new(registry.clone())?);
    if config.metrics.enabled {
        CsiServer::serve_metrics(&config.metrics.addr, registry).await?;
    }

    let identity = IdentityService::with_name(config.driver.name.clone());
    tracing::info!(
        driver = %identity.name(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting Ceph CSI driver"
    );
    let backend: Arc<dyn Backend> = Arc::new(CephCli::new(&config.ceph));

    match cli.mode {
        Mode::Controller => {
            let repo = volume_repository(&config).await?;
            let metadata = Arc::new(VolumeMetadataStore::new(repo));
            metadata.recover().await?;
            metrics.volume_count.set(metadata.len().await as f64);

            let controller = ControllerService::new(metadata, backend, metrics);
            CsiServer::serve_controller(identity, controller, config.driver.endpoint).await
        }
        Mode::Node { node_id } => {
            if let Some(node_id) = node_id {
                config.driver.node_id = node_id;
            }

            let store: Arc<dyn CredentialRepository> =
                Arc::new(FileCredentialRepository::new(config.storage.node_dir()));
            let credentials = Arc::new(CredentialManager::new(backend, store.clone()));
            let node = NodeService::new(
                config.driver.node_id.clone(),
                Arc::new(SystemMounter::new(&config.ceph)),
                credentials,
                Arc::new(NodeCache::with_store(store)),
                CephConfFiles::new(&config.ceph.config_dir),
                metrics,
            );

            tracing::info!(node_id = %config.driver.node_id, "Node service ready");
            CsiServer::serve_node(identity, node, config.driver.endpoint).await
        }
    }
}

async fn volume_repository(config: &Config) -> anyhow::Result<Arc<dyn VolumeRepository>> {
    match config.storage.metadata_backend {
        MetadataBackend::File => {
            let dir = config.storage.controller_dir();
            tracing::info!(dir = %dir.display(), "Using file volume metadata");
            Ok(Arc::new(FileVolumeRepository::new(dir)))
        }
        MetadataBackend::Postgres => {
            let pool = DatabasePool::open(&config.database).await?;
            Ok(Arc::new(PgVolumeRepository::new(pool.pool().clone())))
        }
    }
}
