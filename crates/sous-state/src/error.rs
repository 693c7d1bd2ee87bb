//! Error types for the `sous-state` binary.

use sous_storage::{ConfigError, StoreError};

/// Errors that can stop a `sous-state` command.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The command line could not be understood.
    #[error("usage: {0}")]
    Usage(String),

    /// The storage configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A store call failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The State could not be rendered as JSON.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}
