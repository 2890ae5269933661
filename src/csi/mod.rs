pub mod controller;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod locks;
pub mod metadata;
pub mod metrics;
pub mod node;
pub mod node_cache;
pub mod options;
pub mod server;

pub use controller::ControllerService;
pub use credentials::CredentialManager;
pub use error::{CsiError, CsiResult};
pub use identity::IdentityService;
pub use locks::VolumeLocks;
pub use metadata::VolumeMetadataStore;
pub use metrics::CsiMetrics;
pub use node::NodeService;
pub use node_cache::{NodeCache, NodeCacheEntry, VolumeState};
pub use server::CsiServer;

// Re-export generated proto types
pub mod proto {
    tonic::include_proto!("csi.v0");
}
