//! Domain error model.

use thiserror::Error;

/// Model-level error.
///
/// Keep this focused on deterministic failures (parsing, validation).
/// Directory and transport failures belong to the crates that talk to them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A membership status string was not recognized.
    #[error("unknown membership status: {0}")]
    UnknownStatus(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
