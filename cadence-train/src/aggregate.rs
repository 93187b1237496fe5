//! Per-epoch running means of the scalar errors a model reports each step.

use crate::model::ErrorMap;
use serde::{Deserialize, Serialize};

/// Running sums of per-step error metrics for the current epoch.
///
/// Keys are initialized lazily. A metric that first appears part-way through an
/// epoch is still divided by the epoch's total step count when finalized, so
/// its mean is understated by the fraction of steps it was absent for.
#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    sums: ErrorMap,
    count: u64,
}

/// Epoch-level means produced by [`ErrorStats::finalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Number of steps that contributed.
    pub count: u64,
    pub means: ErrorMap,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one step's metrics.
    pub fn record(&mut self, metrics: &ErrorMap) {
        for (name, value) in metrics {
            *self.sums.entry(name.clone()).or_insert(0.0) += value;
        }
        self.count += 1;
    }

    /// Means over every recorded step, or `None` if nothing was recorded.
    pub fn finalize(&self) -> Option<ErrorSummary> {
        if self.count == 0 {
            return None;
        }
        let divisor = self.count as f64;
        let means = self
            .sums
            .iter()
            .map(|(name, sum)| (name.clone(), sum / divisor))
            .collect();
        Some(ErrorSummary {
            count: self.count,
            means,
        })
    }

    pub fn reset(&mut self) {
        self.sums.clear();
        self.count = 0;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
