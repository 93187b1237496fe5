//! Reference model and data source: linear regression on seeded synthetic data.
//!
//! Small enough to train in seconds, but it exercises every contract the
//! training loop relies on (fallible steps, schedulers, state round-trips).

use cadence_core::TrainConfig;
use cadence_train::{
    DataSource, ErrorMap, Result, Stepper, TrainError, TrainableModel, Visuals, build_scheduler,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// One mini-batch: feature rows and their targets.
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

/// Fixed synthetic dataset `y = w·x + b + noise`, served in order.
pub struct SyntheticRegression {
    features: Vec<Vec<f64>>,
    targets: Vec<f64>,
    batch_size: usize,
    dim: usize,
}

impl SyntheticRegression {
    pub fn generate(samples: usize, dim: usize, batch_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let true_weights: Vec<f64> = (0..dim).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let true_bias: f64 = rng.gen_range(-1.0..1.0);

        let mut features = Vec::with_capacity(samples);
        let mut targets = Vec::with_capacity(samples);
        for _ in 0..samples {
            let x: Vec<f64> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let noise: f64 = rng.gen_range(-0.05..0.05);
            let y = x.iter().zip(&true_weights).map(|(a, w)| a * w).sum::<f64>() + true_bias;
            features.push(x);
            targets.push(y + noise);
        }

        Self {
            features,
            targets,
            batch_size: batch_size.max(1),
            dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl DataSource for SyntheticRegression {
    type Batch = Batch;

    fn dataset_size(&self) -> usize {
        self.features.len().div_ceil(self.batch_size)
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let size = self.batch_size;
        Box::new(
            self.features
                .chunks(size)
                .zip(self.targets.chunks(size))
                .map(|(features, targets)| {
                    Ok(Batch {
                        features: features.to_vec(),
                        targets: targets.to_vec(),
                    })
                }),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelState {
    weights: Vec<f64>,
    bias: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OptimizerState {
    momentum: f64,
    velocity: Vec<f64>,
    bias_velocity: f64,
}

/// Linear regressor trained with momentum SGD on mean squared error.
pub struct LinearRegressor {
    weights: Vec<f64>,
    bias: f64,
    momentum: f64,
    velocity: Vec<f64>,
    bias_velocity: f64,
    scheduler: Box<dyn Stepper>,
    staged: Option<Batch>,
    last_mse: f64,
    last_mae: f64,
}

impl LinearRegressor {
    pub fn new(config: &TrainConfig, dim: usize) -> Self {
        Self {
            weights: vec![0.0; dim],
            bias: 0.0,
            momentum: 0.9,
            velocity: vec![0.0; dim],
            bias_velocity: 0.0,
            scheduler: build_scheduler(config),
            staged: None,
            last_mse: 0.0,
            last_mae: 0.0,
        }
    }

    fn predict(&self, x: &[f64]) -> f64 {
        x.iter().zip(&self.weights).map(|(a, w)| a * w).sum::<f64>() + self.bias
    }
}

impl TrainableModel for LinearRegressor {
    type Batch = Batch;

    fn set_input(&mut self, batch: Batch) -> Result<()> {
        if batch.features.len() != batch.targets.len() {
            return Err(TrainError::data(format!(
                "{} feature rows but {} targets",
                batch.features.len(),
                batch.targets.len()
            )));
        }
        if let Some(row) = batch.features.iter().find(|r| r.len() != self.weights.len()) {
            return Err(TrainError::data(format!(
                "expected {} features, got {}",
                self.weights.len(),
                row.len()
            )));
        }
        self.staged = Some(batch);
        Ok(())
    }

    fn optimize_parameters(&mut self) -> Result<()> {
        let batch = self
            .staged
            .take()
            .ok_or_else(|| TrainError::model("optimize_parameters called without input"))?;
        if batch.targets.is_empty() {
            return Ok(());
        }

        let n = batch.targets.len() as f64;
        let mut grad_w = vec![0.0; self.weights.len()];
        let mut grad_b = 0.0;
        let mut sq = 0.0;
        let mut abs = 0.0;
        for (x, y) in batch.features.iter().zip(&batch.targets) {
            let residual = self.predict(x) - y;
            sq += residual * residual;
            abs += residual.abs();
            for (g, xi) in grad_w.iter_mut().zip(x) {
                *g += 2.0 * residual * xi / n;
            }
            grad_b += 2.0 * residual / n;
        }

        let mse = sq / n;
        if !mse.is_finite() {
            return Err(TrainError::model(format!("loss diverged (mse = {mse})")));
        }
        self.last_mse = mse;
        self.last_mae = abs / n;

        let lr = self.scheduler.rate();
        for ((w, v), g) in self.weights.iter_mut().zip(&mut self.velocity).zip(&grad_w) {
            *v = self.momentum * *v + g;
            *w -= lr * *v;
        }
        self.bias_velocity = self.momentum * self.bias_velocity + grad_b;
        self.bias -= lr * self.bias_velocity;
        Ok(())
    }

    fn current_errors(&self) -> ErrorMap {
        let mut errors = ErrorMap::new();
        errors.insert("mse".into(), self.last_mse);
        errors.insert("mae".into(), self.last_mae);
        errors
    }

    fn current_visuals(&self) -> Visuals {
        let mut visuals = Visuals::new();
        visuals.insert("weights".into(), json!(self.weights));
        visuals.insert("bias".into(), json!(self.bias));
        visuals
    }

    fn schedulers(&mut self) -> Vec<&mut dyn Stepper> {
        vec![self.scheduler.as_mut() as &mut dyn Stepper]
    }

    fn model_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(ModelState {
            weights: self.weights.clone(),
            bias: self.bias,
        })?)
    }

    fn optimizer_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(OptimizerState {
            momentum: self.momentum,
            velocity: self.velocity.clone(),
            bias_velocity: self.bias_velocity,
        })?)
    }

    fn load_state(
        &mut self,
        model_state: serde_json::Value,
        optimizer_state: serde_json::Value,
    ) -> Result<()> {
        let model: ModelState = serde_json::from_value(model_state)?;
        let optim: OptimizerState = serde_json::from_value(optimizer_state)?;
        if model.weights.len() != self.weights.len() || optim.velocity.len() != self.weights.len()
        {
            return Err(TrainError::model(format!(
                "checkpoint has {} weights, model expects {}",
                model.weights.len(),
                self.weights.len()
            )));
        }
        self.weights = model.weights;
        self.bias = model.bias;
        self.momentum = optim.momentum;
        self.velocity = optim.velocity;
        self.bias_velocity = optim.bias_velocity;
        Ok(())
    }
}
