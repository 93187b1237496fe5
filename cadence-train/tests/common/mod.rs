#![allow(dead_code)]

use cadence_core::TrainConfig;
use cadence_train::{
    DataSource, ErrorMap, LinearDecay, Result, Stepper, TrainError, TrainableModel,
    VisualizationSink, Visuals,
};
use serde_json::json;
use std::cell::RefCell;
use std::path::Path;
use std::time::Duration;

/// Scalar "model" with momentum, deterministic enough to compare runs bit for bit.
pub struct MockModel {
    pub weight: f64,
    pub velocity: f64,
    pub steps: u64,
    pub scheduler: LinearDecay,
    pub fail_at: Option<u64>,
    /// Internal step count each time weights were serialized.
    pub snapshots: RefCell<Vec<u64>>,
    staged: Option<f64>,
}

impl MockModel {
    pub fn new(config: &TrainConfig) -> Self {
        Self {
            weight: 1.0,
            velocity: 0.0,
            steps: 0,
            scheduler: LinearDecay::new(
                config.learning_rate,
                config.initial_epoch,
                config.epochs,
                config.decay_epochs,
            ),
            fail_at: None,
            snapshots: RefCell::new(Vec::new()),
            staged: None,
        }
    }

    pub fn failing_at(mut self, step: u64) -> Self {
        self.fail_at = Some(step);
        self
    }
}

impl TrainableModel for MockModel {
    type Batch = f64;

    fn set_input(&mut self, batch: f64) -> Result<()> {
        self.staged = Some(batch);
        Ok(())
    }

    fn optimize_parameters(&mut self) -> Result<()> {
        let x = self
            .staged
            .take()
            .ok_or_else(|| TrainError::model("no input staged"))?;
        self.steps += 1;
        if self.fail_at == Some(self.steps) {
            return Err(TrainError::model("loss diverged"));
        }
        self.velocity = 0.9 * self.velocity + (self.weight - x);
        self.weight -= self.scheduler.rate() * self.velocity;
        Ok(())
    }

    fn current_errors(&self) -> ErrorMap {
        let mut errors = ErrorMap::new();
        errors.insert("loss".into(), self.weight.abs());
        if self.steps % 2 == 0 {
            errors.insert("even_only".into(), 1.0);
        }
        errors
    }

    fn current_visuals(&self) -> Visuals {
        let mut visuals = Visuals::new();
        visuals.insert("weight".into(), json!(self.weight));
        visuals
    }

    fn schedulers(&mut self) -> Vec<&mut dyn Stepper> {
        vec![&mut self.scheduler as &mut dyn Stepper]
    }

    fn model_state(&self) -> Result<serde_json::Value> {
        self.snapshots.borrow_mut().push(self.steps);
        Ok(json!({"weight": self.weight, "steps": self.steps}))
    }

    fn optimizer_state(&self) -> Result<serde_json::Value> {
        Ok(json!({"velocity": self.velocity}))
    }

    fn load_state(
        &mut self,
        model_state: serde_json::Value,
        optimizer_state: serde_json::Value,
    ) -> Result<()> {
        self.weight = model_state["weight"]
            .as_f64()
            .ok_or_else(|| TrainError::model("missing weight"))?;
        self.steps = model_state["steps"]
            .as_u64()
            .ok_or_else(|| TrainError::model("missing steps"))?;
        self.velocity = optimizer_state["velocity"]
            .as_f64()
            .ok_or_else(|| TrainError::model("missing velocity"))?;
        Ok(())
    }
}

/// Yields `batches[i % len]` batches in pass `i`.
pub struct MockData {
    pub batches: Vec<usize>,
    pub passes: usize,
    pub fail_in_pass: Option<usize>,
}

impl MockData {
    pub fn uniform(per_epoch: usize) -> Self {
        Self {
            batches: vec![per_epoch],
            passes: 0,
            fail_in_pass: None,
        }
    }

    pub fn varying(batches: Vec<usize>) -> Self {
        Self {
            batches,
            passes: 0,
            fail_in_pass: None,
        }
    }
}

impl DataSource for MockData {
    type Batch = f64;

    fn dataset_size(&self) -> usize {
        self.batches[0]
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<f64>> + '_> {
        let pass = self.passes;
        self.passes += 1;
        let count = self.batches[pass % self.batches.len()];
        let fail = self.fail_in_pass == Some(pass);
        Box::new((0..count).map(move |i| {
            if fail && i == count / 2 {
                Err(TrainError::data("unreadable sample"))
            } else {
                Ok((i % 7) as f64 * 0.25)
            }
        }))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub prints: Vec<(u64, u64, ErrorMap)>,
    pub plots: Vec<(u64, f64, ErrorMap)>,
    pub displays: Vec<(u64, bool)>,
}

impl VisualizationSink for RecordingSink {
    fn print_current_errors(
        &mut self,
        epoch: u64,
        iter: u64,
        errors: &ErrorMap,
        _elapsed: Duration,
    ) -> Result<()> {
        self.prints.push((epoch, iter, errors.clone()));
        Ok(())
    }

    fn plot_current_errors(
        &mut self,
        epoch: u64,
        progress: f64,
        _config: &TrainConfig,
        errors: &ErrorMap,
    ) -> Result<()> {
        self.plots.push((epoch, progress, errors.clone()));
        Ok(())
    }

    fn display_current_results(
        &mut self,
        _visuals: &Visuals,
        epoch: u64,
        save: bool,
    ) -> Result<()> {
        self.displays.push((epoch, save));
        Ok(())
    }
}

pub fn config(root: &Path, epochs: u64, decay_epochs: u64) -> TrainConfig {
    TrainConfig {
        name: "unit".into(),
        checkpoints_dir: root.to_path_buf(),
        initial_epoch: 1,
        epochs,
        decay_epochs,
        print_interval: 1000,
        save_latest_interval: 1000,
        save_epoch_interval: 1,
        resume: false,
        display: true,
        learning_rate: 0.1,
        ..Default::default()
    }
}
