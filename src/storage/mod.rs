pub mod file;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod traits;

pub use file::{FileCredentialRepository, FileVolumeRepository};
pub use models::*;
pub use pool::DatabasePool;
pub use postgres::PgVolumeRepository;
pub use traits::{CredentialRepository, VolumeRepository};
