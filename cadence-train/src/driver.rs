//! The training loop: epoch/step progression, checkpoint cadences, and resume.

use crate::aggregate::{ErrorStats, ErrorSummary};
use crate::checkpoint::{CheckpointStore, Slot, TrainingPosition};
use crate::error::{Result, TrainError};
use crate::model::{DataSource, TrainableModel};
use crate::schedule;
use crate::visualizer::VisualizationSink;
use cadence_core::TrainConfig;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// What [`TrainingLoop::startup`] found and did.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupReport {
    /// Position the first epoch of this process starts from.
    pub position: TrainingPosition,
    /// Whether a persisted position was found and used.
    pub resumed: bool,
    /// Epochs the rate schedule was fast-forwarded by.
    pub replayed_epochs: u64,
    /// Checkpoint the model weights were restored from, if any.
    pub restored_from: Option<PathBuf>,
}

/// Outcome of one completed epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: u64,
    /// Batches processed in this epoch.
    pub batches: u64,
    /// Step counter after the epoch.
    pub total_steps: u64,
    /// Epoch-mean errors; `None` if the data source yielded nothing.
    pub errors: Option<ErrorSummary>,
    pub elapsed: Duration,
}

/// Outcome of [`TrainingLoop::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub start: TrainingPosition,
    /// Position persisted after the last epoch: the next epoch to run.
    pub end: TrainingPosition,
    pub resumed: bool,
    pub epochs: Vec<EpochSummary>,
}

impl RunSummary {
    pub fn epochs_run(&self) -> usize {
        self.epochs.len()
    }
}

/// Drives a model over a data source for the configured epochs, persisting
/// enough state to continue exactly where it left off after a restart.
///
/// The loop owns the training position and the per-epoch error statistics;
/// nothing else mutates them.
pub struct TrainingLoop<M, D, V> {
    config: TrainConfig,
    store: CheckpointStore,
    model: M,
    data: D,
    sink: V,
    position: TrainingPosition,
    stats: ErrorStats,
    startup: Option<StartupReport>,
}

impl<M, D, V> TrainingLoop<M, D, V>
where
    M: TrainableModel,
    D: DataSource<Batch = M::Batch>,
    V: VisualizationSink,
{
    pub fn new(config: TrainConfig, model: M, data: D, sink: V) -> Result<Self> {
        config.validate()?;
        let store = CheckpointStore::new(config.run_dir());
        let position = TrainingPosition::new(config.initial_epoch, 0);
        Ok(Self {
            config,
            store,
            model,
            data,
            sink,
            position,
            stats: ErrorStats::new(),
            startup: None,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn position(&self) -> TrainingPosition {
        self.position
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn sink(&self) -> &V {
        &self.sink
    }

    pub fn into_parts(self) -> (M, D, V) {
        (self.model, self.data, self.sink)
    }

    /// Establish the starting position, fast-forwarding the rate schedule and
    /// restoring weights when resuming.
    ///
    /// Only the first call does any work; later calls return the same report,
    /// so the schedule is never replayed twice.
    pub fn startup(&mut self) -> Result<StartupReport> {
        if let Some(report) = &self.startup {
            return Ok(report.clone());
        }

        let persisted = if self.config.resume {
            self.store.load_position()?
        } else {
            if self.store.position_path().exists() {
                tracing::warn!(
                    run_dir = %self.store.dir().display(),
                    "resume disabled; starting fresh and overwriting the existing run"
                );
            }
            None
        };

        let report = match persisted {
            Some(position) => self.resume_from(position)?,
            None => {
                self.position = TrainingPosition::new(self.config.initial_epoch, 0);
                StartupReport {
                    position: self.position,
                    resumed: false,
                    replayed_epochs: 0,
                    restored_from: None,
                }
            }
        };

        tracing::info!(
            start_epoch = report.position.epoch,
            total_steps = report.position.total_steps,
            resumed = report.resumed,
            "training start"
        );
        self.startup = Some(report.clone());
        Ok(report)
    }

    fn resume_from(&mut self, position: TrainingPosition) -> Result<StartupReport> {
        tracing::info!(%position, "loaded persisted position");
        self.position = position;

        if position.epoch < self.config.initial_epoch {
            tracing::warn!(
                persisted_epoch = position.epoch,
                initial_epoch = self.config.initial_epoch,
                "persisted epoch precedes the configured initial epoch; schedule not replayed"
            );
        }
        let completed = position.epoch.saturating_sub(self.config.initial_epoch);
        schedule::replay(self.model.schedulers(), completed);

        self.store.pin(position.total_steps);
        let restored_from = if position.total_steps == 0 {
            None
        } else if position.epoch > self.config.final_epoch() {
            tracing::debug!(%position, "run already finished; weights not restored");
            None
        } else {
            Some(self.restore_at(position)?)
        };

        Ok(StartupReport {
            position,
            resumed: true,
            replayed_epochs: completed,
            restored_from,
        })
    }

    /// Load the checkpoint taken at exactly `position.total_steps`. Weights
    /// from any other step would repeat or skip optimizer steps, so a missing
    /// match is an error.
    fn restore_at(&mut self, position: TrainingPosition) -> Result<PathBuf> {
        let entry = self.store.checkpoint_at(position.total_steps)?.ok_or_else(|| {
            let newest = self
                .store
                .latest(Slot::Latest)
                .ok()
                .flatten()
                .map_or_else(|| "none".to_string(), |e| e.position.to_string());
            TrainError::corrupt(
                self.store.position_path(),
                format!(
                    "no checkpoint at step {} to resume from (newest latest: {newest})",
                    position.total_steps
                ),
            )
        })?;

        let record = self.store.load(&entry.path)?;
        self.model
            .load_state(record.model_state, record.optimizer_state)?;
        tracing::info!(
            slot = %entry.slot,
            path = %entry.path.display(),
            "restored model state"
        );
        Ok(entry.path)
    }

    /// Train from the current position through the configured final epoch.
    pub fn run(&mut self) -> Result<RunSummary> {
        let startup = self.startup()?;
        let start = self.position;
        let final_epoch = self.config.final_epoch();
        if start.epoch > final_epoch {
            tracing::info!(final_epoch, "all epochs already completed");
        }

        let mut epochs = Vec::new();
        while self.position.epoch <= final_epoch {
            epochs.push(self.train_epoch()?);
        }

        Ok(RunSummary {
            start,
            end: self.position,
            resumed: startup.resumed,
            epochs,
        })
    }

    fn train_epoch(&mut self) -> Result<EpochSummary> {
        let epoch = self.position.epoch;
        let epoch_start = Instant::now();
        let mut iter_start = epoch_start;
        let mut epoch_iter = 0u64;
        self.stats.reset();

        for batch in self.data.batches() {
            let batch = batch
                .inspect_err(|e| tracing::error!(epoch, error = %e, "data source failed"))?;
            iter_start = Instant::now();
            self.position.total_steps += 1;
            epoch_iter += 1;
            let total_steps = self.position.total_steps;

            self.model.set_input(batch)?;
            self.model.optimize_parameters().inspect_err(
                |e| tracing::error!(epoch, total_steps, error = %e, "optimization step failed"),
            )?;

            let errors = self.model.current_errors();
            self.stats.record(&errors);

            if total_steps % self.config.print_interval == 0 {
                self.sink.print_current_errors(
                    epoch,
                    epoch_iter,
                    &errors,
                    iter_start.elapsed(),
                )?;
            }

            if total_steps % self.config.save_latest_interval == 0 {
                tracing::info!(epoch, total_steps, "saving the latest model");
                save_checkpoint(&mut self.store, &self.model, Slot::Latest, self.position)?;
            }
        }

        let summary = self.stats.finalize();
        match &summary {
            Some(summary) => {
                self.sink.print_current_errors(
                    epoch,
                    epoch_iter,
                    &summary.means,
                    iter_start.elapsed(),
                )?;
                if self.config.display {
                    let dataset_size = self.data.dataset_size();
                    let progress = if dataset_size == 0 {
                        0.0
                    } else {
                        epoch_iter as f64 / dataset_size as f64
                    };
                    self.sink
                        .plot_current_errors(epoch, progress, &self.config, &summary.means)?;
                }
            }
            None => tracing::warn!(epoch, "data source yielded no batches"),
        }
        self.stats.reset();

        self.sink
            .display_current_results(&self.model.current_visuals(), epoch, false)?;

        if epoch % self.config.save_epoch_interval == 0 {
            tracing::info!(
                epoch,
                total_steps = self.position.total_steps,
                "saving the model at the end of epoch"
            );
            save_checkpoint(&mut self.store, &self.model, Slot::Epoch, self.position)?;
            save_checkpoint(&mut self.store, &self.model, Slot::Latest, self.position)?;
        }

        let elapsed = epoch_start.elapsed();
        tracing::info!(
            "End of epoch {} / {} \t Time Taken: {} sec",
            epoch,
            self.config.final_epoch(),
            elapsed.as_secs()
        );

        self.model.update_learning_rate();
        if let Some(rate) = self.model.schedulers().first().map(|s| s.rate()) {
            tracing::info!("learning rate = {rate:.7}");
        }

        let next = TrainingPosition::new(epoch + 1, self.position.total_steps);
        self.store.save_position(next)?;
        self.position = next;

        Ok(EpochSummary {
            epoch,
            batches: epoch_iter,
            total_steps: next.total_steps,
            errors: summary,
            elapsed,
        })
    }
}

fn save_checkpoint<M: TrainableModel>(
    store: &mut CheckpointStore,
    model: &M,
    slot: Slot,
    position: TrainingPosition,
) -> Result<PathBuf> {
    let model_state = model.model_state()?;
    let optimizer_state = model.optimizer_state()?;
    store.save(slot, position, &model_state, &optimizer_state)
}
