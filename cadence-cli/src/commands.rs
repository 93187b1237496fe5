//! Subcommand handlers.

use crate::toy::{LinearRegressor, SyntheticRegression};
use crate::{Commands, ConfigAction};
use cadence_core::{ConfigOverrides, TrainConfig, load_config};
use cadence_train::{CheckpointStore, LossLogSink, RunSummary, Slot, TrainingLoop};
use std::path::{Path, PathBuf};

/// Exit status after Ctrl-C, as shells report for SIGINT.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Training was interrupted; the blocking task may still be running.
    Interrupted,
}

/// Flags for `cadence train`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TrainArgs {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Root directory holding run directories
    #[arg(long)]
    pub checkpoints_dir: Option<PathBuf>,

    /// Continue from the run's persisted position
    #[arg(long)]
    pub resume: bool,

    /// Epoch number a fresh run starts at
    #[arg(long)]
    pub initial_epoch: Option<u64>,

    /// Epochs at the base learning rate
    #[arg(long)]
    pub epochs: Option<u64>,

    /// Epochs of learning-rate decay
    #[arg(long)]
    pub decay_epochs: Option<u64>,

    /// Report errors every N steps
    #[arg(long)]
    pub print_interval: Option<u64>,

    /// Save the latest checkpoint every N steps
    #[arg(long)]
    pub save_latest_interval: Option<u64>,

    /// Save epoch checkpoints every N epochs
    #[arg(long)]
    pub save_epoch_interval: Option<u64>,

    /// Skip loss-curve plot points
    #[arg(long)]
    pub no_display: bool,

    /// Base learning rate
    #[arg(long)]
    pub lr: Option<f64>,

    /// Synthetic samples in the reference dataset
    #[arg(long, default_value_t = 512)]
    pub samples: usize,

    /// Feature dimension of the reference dataset
    #[arg(long, default_value_t = 8)]
    pub features: usize,

    /// Samples per batch
    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    /// Seed for the synthetic dataset
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl TrainArgs {
    /// Flags the user actually passed, as a top configuration layer.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            name: self.name.clone(),
            checkpoints_dir: self.checkpoints_dir.clone(),
            initial_epoch: self.initial_epoch,
            epochs: self.epochs,
            decay_epochs: self.decay_epochs,
            print_interval: self.print_interval,
            save_latest_interval: self.save_latest_interval,
            save_epoch_interval: self.save_epoch_interval,
            resume: self.resume.then_some(true),
            display: self.no_display.then_some(false),
            learning_rate: self.lr,
        }
    }
}

pub async fn handle_command(command: Commands) -> anyhow::Result<Outcome> {
    match command {
        Commands::Train(args) => train(args).await,
        Commands::Status {
            config,
            name,
            checkpoints_dir,
        } => {
            let overrides = ConfigOverrides {
                name,
                checkpoints_dir,
                ..Default::default()
            };
            let config = load_config(config.as_deref(), Some(&overrides))
                .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
            print_status(&config)?;
            Ok(Outcome::Completed)
        }
        Commands::Config { action } => {
            match action {
                ConfigAction::Init { path, force } => init_config(&path, force)?,
                ConfigAction::Show { config } => {
                    let config = load_config(config.as_deref(), None)
                        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
                    print!("{}", toml::to_string_pretty(&config)?);
                }
            }
            Ok(Outcome::Completed)
        }
    }
}

async fn train(args: TrainArgs) -> anyhow::Result<Outcome> {
    let config = load_config(args.config.as_deref(), Some(&args.overrides()))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let run_name = config.name.clone();

    let handle = tokio::task::spawn_blocking(move || run_training(config, &args));

    tokio::select! {
        joined = handle => {
            let summary = joined??;
            print_summary(&summary);
            Ok(Outcome::Completed)
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(
                run = %run_name,
                "interrupted; continue with `cadence train --resume --name {run_name}`"
            );
            Ok(Outcome::Interrupted)
        }
    }
}

/// Train the reference model under `config` to completion.
pub fn run_training(config: TrainConfig, args: &TrainArgs) -> anyhow::Result<RunSummary> {
    let data =
        SyntheticRegression::generate(args.samples, args.features, args.batch_size, args.seed);
    let model = LinearRegressor::new(&config, data.dim());
    let sink = LossLogSink::open(config.run_dir())?;

    tracing::info!(
        run = %config.name,
        run_dir = %config.run_dir().display(),
        final_epoch = config.final_epoch(),
        "starting training"
    );
    let mut trainer = TrainingLoop::new(config, model, data, sink)?;
    Ok(trainer.run()?)
}

fn print_summary(summary: &RunSummary) {
    if summary.epochs.is_empty() {
        println!("Nothing to do: run already finished at {}.", summary.end);
        return;
    }
    println!(
        "Trained {} epoch(s){}: {} -> {}",
        summary.epochs_run(),
        if summary.resumed { " (resumed)" } else { "" },
        summary.start,
        summary.end
    );
    if let Some(means) = summary.epochs.last().and_then(|e| e.errors.as_ref()) {
        for (name, value) in &means.means {
            println!("  {name}: {value:.6}");
        }
    }
}

fn print_status(config: &TrainConfig) -> anyhow::Result<()> {
    let store = CheckpointStore::new(config.run_dir());
    println!("Run: {} ({})", config.name, store.dir().display());

    match store.load_position()? {
        Some(position) if position.epoch > config.final_epoch() => {
            println!("Position: {position} (finished)");
        }
        Some(position) => {
            println!("Position: {position} of {} epochs", config.final_epoch());
        }
        None => println!(
            "Position: none (a new run would start at epoch {})",
            config.initial_epoch
        ),
    }

    for slot in Slot::ALL {
        match store.latest(slot)? {
            Some(entry) => println!(
                "  {:<7} {} ({})",
                slot.as_str(),
                entry.position,
                entry.path.display()
            ),
            None => println!("  {:<7} -", slot.as_str()),
        }
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let contents = toml::to_string_pretty(&TrainConfig::default())?;
    cadence_core::atomic_write(path, contents.as_bytes())?;
    println!("Wrote {}", path.display());
    Ok(())
}
