//! Infrastructure layer: configuration, directory adapters, registrar client, background jobs.

pub mod config;
pub mod directory;
pub mod jobs;
pub mod perun;
pub mod registrar;

pub use config::{ConfigError, MemberguardConfig};
pub use directory::InMemoryDirectory;
pub use jobs::{DirectorySink, SyncQueue, SyncQueueConfig, SyncTask};
pub use perun::{PerunRpcClient, PerunRpcOracle};
pub use registrar::HttpResultClient;
