//! Error types for the Cadence core library.
//!
//! Persistence helpers report plain `std::io::Error`; configuration has its
//! own `thiserror` type.

use std::path::PathBuf;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("configuration file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
