//! keeper-core: configuration schema, error taxonomy and shared data model

pub mod config;
pub mod error;
pub mod types;

pub use config::KeeperConfig;
pub use error::{KeeperError, KeeperResult};
pub use types::{File, Pagination, RemoteRow, SyncCheckpoint, UploadsPage};
