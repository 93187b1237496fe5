//! Error types for the cadence-train crate.
//!
//! Every variant is fatal to a training run: the loop performs no retries and
//! recovery happens by restarting from the last persisted position.

use crate::checkpoint::Slot;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for training operations.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Data source error: {0}")]
    Data(String),

    #[error("Checkpoint I/O failed for {}: {source}", path.display())]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Refusing to save slot `{slot}` at step {attempted}: already saved at step {last}")]
    StepRegression { slot: Slot, last: u64, attempted: u64 },

    #[error("Configuration error: {0}")]
    Config(#[from] cadence_core::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TrainError {
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn checkpoint(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Checkpoint {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias for training results.
pub type Result<T> = std::result::Result<T, TrainError>;
