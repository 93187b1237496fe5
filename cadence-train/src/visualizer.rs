//! Reporting sinks for training progress.

use crate::error::Result;
use crate::model::{ErrorMap, Visuals};
use cadence_core::TrainConfig;
use cadence_core::persistence::{atomic_write_json, load_json};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Receiver for the loop's periodic reports.
pub trait VisualizationSink {
    /// Current (per-step or epoch-mean) errors with the elapsed iteration time.
    fn print_current_errors(
        &mut self,
        epoch: u64,
        iter: u64,
        errors: &ErrorMap,
        elapsed: Duration,
    ) -> Result<()>;

    /// One point on the loss curve at `epoch + progress`.
    fn plot_current_errors(
        &mut self,
        epoch: u64,
        progress: f64,
        config: &TrainConfig,
        errors: &ErrorMap,
    ) -> Result<()>;

    /// The model's current visual outputs; `save` asks for them to be kept on disk.
    fn display_current_results(&mut self, visuals: &Visuals, epoch: u64, save: bool)
    -> Result<()>;
}

/// Accumulated loss curve, persisted as `plot.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlotData {
    pub title: String,
    pub legend: Vec<String>,
    pub x: Vec<f64>,
    pub y: Vec<Vec<Option<f64>>>,
}

/// Sink that appends to `loss_log.txt`, keeps `plot.json` current, and writes
/// saved visuals under `visuals/`. Every report is also logged via `tracing`.
pub struct LossLogSink {
    dir: PathBuf,
    plot: PlotData,
}

impl LossLogSink {
    /// Open the sink in `dir`, continuing an existing loss curve if present.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let plot = load_json::<PlotData>(&dir.join("plot.json")).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring unreadable plot data");
            None
        });

        let sink = Self {
            dir,
            plot: plot.unwrap_or_default(),
        };
        sink.append_log(&format!(
            "================ Training Loss ({}) ================",
            chrono::Local::now().format("%a %b %e %H:%M:%S %Y")
        ))?;
        Ok(sink)
    }

    pub fn loss_log_path(&self) -> PathBuf {
        self.dir.join("loss_log.txt")
    }

    pub fn plot_path(&self) -> PathBuf {
        self.dir.join("plot.json")
    }

    pub fn plot(&self) -> &PlotData {
        &self.plot
    }

    fn append_log(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.loss_log_path())?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn visuals_path(dir: &Path, epoch: u64) -> PathBuf {
        dir.join("visuals").join(format!("epoch_{epoch:03}.json"))
    }
}

/// `(epoch: 3, iters: 200, time: 0.041) G_GAN: 0.693 G_L1: 12.100`
pub fn format_errors(epoch: u64, iter: u64, errors: &ErrorMap, elapsed: Duration) -> String {
    let mut line = format!(
        "(epoch: {epoch}, iters: {iter}, time: {:.3})",
        elapsed.as_secs_f64()
    );
    for (name, value) in errors {
        line.push_str(&format!(" {name}: {value:.3}"));
    }
    line
}

impl VisualizationSink for LossLogSink {
    fn print_current_errors(
        &mut self,
        epoch: u64,
        iter: u64,
        errors: &ErrorMap,
        elapsed: Duration,
    ) -> Result<()> {
        let line = format_errors(epoch, iter, errors, elapsed);
        tracing::info!("{line}");
        self.append_log(&line)
    }

    fn plot_current_errors(
        &mut self,
        epoch: u64,
        progress: f64,
        config: &TrainConfig,
        errors: &ErrorMap,
    ) -> Result<()> {
        // Metrics first seen now get a column; earlier points lack them.
        for name in errors.keys() {
            if !self.plot.legend.contains(name) {
                self.plot.legend.push(name.clone());
                for row in &mut self.plot.y {
                    row.push(None);
                }
            }
        }
        self.plot.title = format!("{} loss over time", config.name);
        self.plot.x.push(epoch as f64 + progress);
        self.plot.y.push(
            self.plot
                .legend
                .iter()
                .map(|name| errors.get(name).copied())
                .collect(),
        );
        atomic_write_json(&self.plot_path(), &self.plot)?;
        Ok(())
    }

    fn display_current_results(
        &mut self,
        visuals: &Visuals,
        epoch: u64,
        save: bool,
    ) -> Result<()> {
        if !save {
            tracing::debug!(epoch, visuals = visuals.len(), "current results");
            return Ok(());
        }
        let path = Self::visuals_path(&self.dir, epoch);
        atomic_write_json(&path, visuals)?;
        tracing::debug!(epoch, path = %path.display(), "saved current results");
        Ok(())
    }
}
