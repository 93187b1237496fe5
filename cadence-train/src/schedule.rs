//! Epoch-level rate schedules and the fast-forward used when resuming.
//!
//! Schedulers hold only an epoch counter and derive their rate from it, so
//! replaying `n` advances reproduces exactly the state a continuous run would
//! have reached after `n` epochs.

use cadence_core::{LrPolicy, TrainConfig};

/// A stateful policy advanced once per completed epoch.
pub trait Stepper {
    /// Move to the next epoch.
    fn advance(&mut self);

    /// Rate in effect for the current epoch.
    fn rate(&self) -> f64;

    /// Number of times [`Stepper::advance`] has been called.
    fn epochs_advanced(&self) -> u64;
}

/// Fast-forward every stepper by `completed_epochs`, in list order.
///
/// Must be called once, before the first trained epoch; a second call
/// advances the schedule again. Returns the number of steppers replayed.
pub fn replay<'a, I>(steppers: I, completed_epochs: u64) -> usize
where
    I: IntoIterator<Item = &'a mut dyn Stepper>,
{
    let mut replayed = 0;
    for stepper in steppers {
        for _ in 0..completed_epochs {
            stepper.advance();
        }
        tracing::debug!(
            stepper = replayed,
            completed_epochs,
            rate = stepper.rate(),
            "replayed schedule"
        );
        replayed += 1;
    }
    replayed
}

/// Constant rate for `epochs`, then linear decay towards zero over
/// `decay_epochs`. Runs that start at a later `initial_epoch` begin decaying
/// correspondingly earlier in their own advance count.
#[derive(Debug, Clone)]
pub struct LinearDecay {
    base_rate: f64,
    initial_epoch: u64,
    epochs: u64,
    decay_epochs: u64,
    advanced: u64,
}

impl LinearDecay {
    pub fn new(base_rate: f64, initial_epoch: u64, epochs: u64, decay_epochs: u64) -> Self {
        Self {
            base_rate,
            initial_epoch,
            epochs,
            decay_epochs,
            advanced: 0,
        }
    }

    fn factor(&self) -> f64 {
        let progressed = (self.advanced + self.initial_epoch) as f64 - self.epochs as f64;
        1.0 - progressed.max(0.0) / (self.decay_epochs as f64 + 1.0)
    }
}

impl Stepper for LinearDecay {
    fn advance(&mut self) {
        self.advanced += 1;
    }

    fn rate(&self) -> f64 {
        self.base_rate * self.factor()
    }

    fn epochs_advanced(&self) -> u64 {
        self.advanced
    }
}

/// Multiplies the rate by `gamma` every `step_size` epochs.
///
/// Formula: rate = base * gamma^(floor(advanced / step_size))
#[derive(Debug, Clone)]
pub struct StepDecay {
    base_rate: f64,
    step_size: u64,
    gamma: f64,
    advanced: u64,
}

impl StepDecay {
    pub fn new(base_rate: f64, step_size: u64, gamma: f64) -> Self {
        Self {
            base_rate,
            step_size,
            gamma,
            advanced: 0,
        }
    }
}

impl Stepper for StepDecay {
    fn advance(&mut self) {
        self.advanced += 1;
    }

    fn rate(&self) -> f64 {
        if self.step_size == 0 {
            return self.base_rate;
        }
        let decays = (self.advanced / self.step_size) as i32;
        self.base_rate * self.gamma.powi(decays)
    }

    fn epochs_advanced(&self) -> u64 {
        self.advanced
    }
}

#[derive(Debug, Clone)]
pub struct Constant {
    rate: f64,
    advanced: u64,
}

impl Constant {
    pub fn new(rate: f64) -> Self {
        Self { rate, advanced: 0 }
    }
}

impl Stepper for Constant {
    fn advance(&mut self) {
        self.advanced += 1;
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn epochs_advanced(&self) -> u64 {
        self.advanced
    }
}

/// Build the scheduler described by `config.schedule`.
pub fn build_scheduler(config: &TrainConfig) -> Box<dyn Stepper> {
    match &config.schedule {
        LrPolicy::Linear => Box::new(LinearDecay::new(
            config.learning_rate,
            config.initial_epoch,
            config.epochs,
            config.decay_epochs,
        )),
        LrPolicy::Step { step_size, gamma } => {
            Box::new(StepDecay::new(config.learning_rate, *step_size, *gamma))
        }
        LrPolicy::Constant => Box::new(Constant::new(config.learning_rate)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-12, "{a} != {b}");
    }

    #[test]
    fn test_linear_decay_holds_then_decays() {
        // Epochs 1..=4 at full rate, then 4 decay epochs.
        let mut sched = LinearDecay::new(1.0, 1, 4, 4);
        let mut rates = Vec::new();
        for _ in 0..8 {
            rates.push(sched.rate());
            sched.advance();
        }
        let expected = [1.0, 1.0, 1.0, 1.0, 0.8, 0.6, 0.4, 0.2];
        for (got, want) in rates.iter().zip(expected) {
            assert_close(*got, want);
        }
    }

    #[test]
    fn test_linear_decay_later_initial_epoch() {
        let from_one = {
            let mut s = LinearDecay::new(0.5, 1, 10, 10);
            for _ in 0..12 {
                s.advance();
            }
            s.rate()
        };
        let from_five = {
            let mut s = LinearDecay::new(0.5, 5, 10, 10);
            for _ in 0..8 {
                s.advance();
            }
            s.rate()
        };
        // Both are in epoch 13 of the run.
        assert_close(from_one, from_five);
    }

    #[test]
    fn test_step_decay() {
        let mut sched = StepDecay::new(0.1, 3, 0.5);
        assert_close(sched.rate(), 0.1);
        for _ in 0..3 {
            sched.advance();
        }
        assert_close(sched.rate(), 0.05);
        for _ in 0..3 {
            sched.advance();
        }
        assert_close(sched.rate(), 0.025);
    }

    #[test]
    fn test_replay_advances_each_stepper() {
        let mut linear = LinearDecay::new(1.0, 1, 2, 2);
        let mut step = StepDecay::new(1.0, 1, 0.5);
        let replayed = replay([&mut linear as &mut dyn Stepper, &mut step], 3);

        assert_eq!(replayed, 2);
        assert_eq!(linear.epochs_advanced(), 3);
        assert_eq!(step.epochs_advanced(), 3);
        assert_close(step.rate(), 0.125);
    }

    #[test]
    fn test_replay_matches_continuous_advance() {
        let mut continuous = LinearDecay::new(2e-4, 1, 5, 5);
        for _ in 0..7 {
            continuous.advance();
        }
        let mut resumed = LinearDecay::new(2e-4, 1, 5, 5);
        replay([&mut resumed as &mut dyn Stepper], 7);
        assert_eq!(continuous.rate(), resumed.rate());
    }

    #[test]
    fn test_replay_zero_is_noop() {
        let mut sched = Constant::new(0.3);
        replay([&mut sched as &mut dyn Stepper], 0);
        assert_eq!(sched.epochs_advanced(), 0);
    }

    #[test]
    fn test_replay_twice_double_advances() {
        let mut sched = Constant::new(0.3);
        replay([&mut sched as &mut dyn Stepper], 2);
        replay([&mut sched as &mut dyn Stepper], 2);
        assert_eq!(sched.epochs_advanced(), 4);
    }

    #[test]
    fn test_build_scheduler_from_config() {
        let config = TrainConfig {
            learning_rate: 0.01,
            schedule: LrPolicy::Step {
                step_size: 2,
                gamma: 0.1,
            },
            ..Default::default()
        };
        let mut sched = build_scheduler(&config);
        sched.advance();
        sched.advance();
        assert_close(sched.rate(), 0.001);
    }
}
