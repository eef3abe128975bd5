//! Error types shared by updater crates

use thiserror::Error;

/// Result type alias for shared updater operations
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors raised while bootstrapping an updater process
#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidSetting { key: String, message: String },

    #[error("Missing required setting: {0}")]
    MissingSetting(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl UpdaterError {
    pub fn invalid(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            message: message.to_string(),
        }
    }
}
