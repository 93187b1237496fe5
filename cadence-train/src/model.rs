//! Contracts for the collaborators the training loop drives: the model being
//! trained and the data source feeding it.

use crate::error::Result;
use crate::schedule::Stepper;
use std::collections::BTreeMap;

/// Named scalar errors reported by a model after a step.
pub type ErrorMap = BTreeMap<String, f64>;

/// Named visual outputs (images, samples, embeddings) in a serializable form.
pub type Visuals = BTreeMap<String, serde_json::Value>;

/// A model the training loop can step, checkpoint, and restore.
pub trait TrainableModel {
    type Batch;

    /// Stage the next batch for [`TrainableModel::optimize_parameters`].
    fn set_input(&mut self, batch: Self::Batch) -> Result<()>;

    /// Run one forward/backward/update step on the staged batch.
    fn optimize_parameters(&mut self) -> Result<()>;

    /// Errors from the most recent step.
    fn current_errors(&self) -> ErrorMap;

    fn current_visuals(&self) -> Visuals {
        Visuals::new()
    }

    /// The model's rate schedulers, in a stable order.
    fn schedulers(&mut self) -> Vec<&mut dyn Stepper>;

    /// Advance every scheduler by one epoch.
    fn update_learning_rate(&mut self) {
        for scheduler in self.schedulers() {
            scheduler.advance();
        }
    }

    fn model_state(&self) -> Result<serde_json::Value>;

    fn optimizer_state(&self) -> Result<serde_json::Value>;

    /// Restore weights and optimizer state from a checkpoint.
    fn load_state(
        &mut self,
        model_state: serde_json::Value,
        optimizer_state: serde_json::Value,
    ) -> Result<()>;
}

/// A finite, restartable sequence of batches, consumed once per epoch.
pub trait DataSource {
    type Batch;

    /// Batches in one pass, used only for progress reporting.
    fn dataset_size(&self) -> usize;

    /// Start a fresh pass over the data.
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Self::Batch>> + '_>;
}
