//! Tracing/logging setup shared by the binaries.

/// Initialize process-wide tracing with defaults (JSON, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::TracingOptions::default());
}

/// Tracing configuration (format, filter).
pub mod tracing;

pub use tracing::{LogFormat, TracingOptions, UnknownLogFormat};
