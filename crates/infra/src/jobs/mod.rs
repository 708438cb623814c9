//! Background work decoupled from request latency.
//!
//! - `RetryPolicy`: capped exponential backoff
//! - `SyncQueue`: bounded worker pool for directory synchronization

pub mod retry;
pub mod sync;

pub use retry::RetryPolicy;
pub use sync::{DirectorySink, SyncQueue, SyncQueueConfig, SyncStats, SyncTask};
