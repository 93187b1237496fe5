//! # cadence-train: resumable training-loop orchestration
//!
//! Drives a [`TrainableModel`] over a [`DataSource`] epoch by epoch:
//!
//! - [`ErrorStats`] turns per-step errors into epoch means.
//! - [`CheckpointStore`] persists slot checkpoints and the resume position atomically.
//! - [`schedule::replay`] fast-forwards rate schedulers on resume.
//! - [`TrainingLoop`] ties them together with the print/save cadences.
//!
//! A killed process is resumed by starting it again with `resume` enabled; the
//! epoch/step trajectory continues as if it had never stopped.

pub mod aggregate;
pub mod checkpoint;
pub mod driver;
pub mod error;
pub mod model;
pub mod schedule;
pub mod visualizer;

pub use aggregate::{ErrorStats, ErrorSummary};
pub use checkpoint::{CheckpointEntry, CheckpointRecord, CheckpointStore, Slot, TrainingPosition};
pub use driver::{EpochSummary, RunSummary, StartupReport, TrainingLoop};
pub use error::{Result, TrainError};
pub use model::{DataSource, ErrorMap, TrainableModel, Visuals};
pub use schedule::{Constant, LinearDecay, StepDecay, Stepper, build_scheduler};
pub use visualizer::{LossLogSink, PlotData, VisualizationSink};
