//! Configuration system for Cadence training runs.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment -> CLI overrides.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Learning-rate policy applied once per epoch boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LrPolicy {
    #[default]
    /// Hold the base rate for `epochs`, then decay linearly to zero over `decay_epochs`.
    Linear,
    /// Multiply the rate by `gamma` every `step_size` epochs.
    Step { step_size: u64, gamma: f64 },
    /// Never change the rate.
    Constant,
}

/// Configuration for a single training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Run name; checkpoints live under `checkpoints_dir/name`.
    pub name: String,
    /// Root directory holding one subdirectory per run.
    pub checkpoints_dir: PathBuf,
    /// Epoch number a fresh run starts at.
    pub initial_epoch: u64,
    /// Epochs trained at the base learning rate.
    pub epochs: u64,
    /// Epochs over which the learning rate decays.
    pub decay_epochs: u64,
    /// Report current errors every N steps.
    pub print_interval: u64,
    /// Save the "latest" slot every N steps.
    pub save_latest_interval: u64,
    /// Save the "epoch" and "latest" slots every N epochs.
    pub save_epoch_interval: u64,
    /// Continue from the persisted position of `name` if one exists.
    pub resume: bool,
    /// Emit progress plot points at epoch end.
    pub display: bool,
    /// Base learning rate handed to schedulers.
    pub learning_rate: f64,
    pub schedule: LrPolicy,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            name: "experiment_name".to_string(),
            checkpoints_dir: PathBuf::from("./checkpoints"),
            initial_epoch: 1,
            epochs: 100,
            decay_epochs: 100,
            print_interval: 100,
            save_latest_interval: 5000,
            save_epoch_interval: 5,
            resume: false,
            display: true,
            learning_rate: 0.0002,
            schedule: LrPolicy::default(),
        }
    }
}

impl TrainConfig {
    /// Last epoch to run, inclusive. Saturates; [`TrainConfig::validate`]
    /// rejects configurations where it would overflow.
    pub fn final_epoch(&self) -> u64 {
        self.epochs.saturating_add(self.decay_epochs)
    }

    /// Directory holding this run's checkpoints, position record, and logs.
    pub fn run_dir(&self) -> PathBuf {
        self.checkpoints_dir.join(&self.name)
    }

    /// Reject configurations the training loop cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        for (field, value) in [
            ("print_interval", self.print_interval),
            ("save_latest_interval", self.save_latest_interval),
            ("save_epoch_interval", self.save_epoch_interval),
            ("initial_epoch", self.initial_epoch),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        // The loop counts one past the final epoch.
        if self
            .epochs
            .checked_add(self.decay_epochs)
            .and_then(|last| last.checked_add(1))
            .is_none()
        {
            return Err(ConfigError::invalid(
                "decay_epochs",
                format!(
                    "epochs ({}) + decay_epochs ({}) is too large",
                    self.epochs, self.decay_epochs
                ),
            ));
        }
        if self.initial_epoch > self.final_epoch() {
            return Err(ConfigError::invalid(
                "initial_epoch",
                format!(
                    "{} is past the final epoch {}",
                    self.initial_epoch,
                    self.final_epoch()
                ),
            ));
        }
        if let LrPolicy::Step { step_size: 0, .. } = self.schedule {
            return Err(ConfigError::invalid("schedule.step_size", "must be at least 1"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
            return Err(ConfigError::invalid(
                "learning_rate",
                "must be a finite, non-negative number",
            ));
        }
        Ok(())
    }
}

/// Per-field overrides, typically from command-line flags. Unset fields leave
/// lower layers untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoints_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_epoch: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epochs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decay_epochs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_latest_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_epoch_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
}

/// Path of the per-user config file, if the platform has a config directory.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "cadence", "cadence")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `CADENCE_`, nested keys split on `__`)
/// 3. Explicit config file (`--config`)
/// 4. User config (`~/.config/cadence/config.toml`)
/// 5. Built-in defaults
///
/// The result is validated before it is returned.
pub fn load_config(
    file: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<TrainConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TrainConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(file) = file {
        if !file.exists() {
            return Err(ConfigError::MissingFile(file.to_path_buf()));
        }
        figment = figment.merge(Toml::file(file));
    }

    // CADENCE_EPOCHS, CADENCE_SCHEDULE__POLICY, etc.
    figment = figment.merge(Env::prefixed("CADENCE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: TrainConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    tracing::debug!(
        name = %config.name,
        final_epoch = config.final_epoch(),
        "configuration loaded"
    );
    Ok(config)
}
