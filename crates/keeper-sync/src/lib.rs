//! keeper-sync: reconcile a local vault against the remote server
//!
//! - [`dispatcher`]: fixed-size worker pool with fan-in results
//! - [`remote`]: the [`RemoteVault`] seam, with [`HttpRemote`] as the reqwest client
//! - [`checkpoint`]: per-owner "synced up to" markers
//! - [`reconcile`]: the [`SyncReconciler`] pass itself

pub mod checkpoint;
pub mod dispatcher;
pub mod http;
pub mod reconcile;
pub mod remote;

pub use checkpoint::CheckpointStore;
pub use dispatcher::{Job, JobResult, WorkDispatcher};
pub use http::HttpRemote;
pub use reconcile::{SyncReconciler, SyncReport};
pub use remote::{BlobReader, RemoteVault, UploadMeta};
