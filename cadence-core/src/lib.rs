//! # Cadence Core
//!
//! Shared foundations for Cadence: crash-safe file persistence and the
//! layered training configuration.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{ConfigOverrides, LrPolicy, TrainConfig, load_config};
pub use error::ConfigError;
pub use persistence::{atomic_write, atomic_write_json, load_json};
