// src/upload/scheduler.rs
//! Adaptive delay between upload cycles
//!
//! The delay starts at `step × default_factor` and moves inside
//! `[step × min_factor, step × max_factor]`: it shrinks while a backlog is
//! draining and grows (with a little jitter) when idle or failing.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Base step between upload cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadFrequency {
    Frequent,
    #[default]
    Average,
    Rare,
}

impl UploadFrequency {
    pub fn base_step(&self) -> Duration {
        match self {
            UploadFrequency::Frequent => Duration::from_millis(500),
            UploadFrequency::Average => Duration::from_millis(2_000),
            UploadFrequency::Rare => Duration::from_millis(5_000),
        }
    }
}

/// Scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Base step
    pub frequency: UploadFrequency,

    /// Lower bound, as a multiple of the step
    pub min_factor: f64,

    /// Starting delay, as a multiple of the step
    pub default_factor: f64,

    /// Upper bound, as a multiple of the step
    pub max_factor: f64,

    /// Multiplier applied while draining a backlog
    pub decrease_ratio: f64,

    /// Multiplier applied when idle or failing
    pub increase_ratio: f64,

    /// Up to this fraction of the current delay is added as jitter on increase
    pub jitter_ratio: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frequency: UploadFrequency::Average,
            min_factor: 0.5,
            default_factor: 1.0,
            max_factor: 10.0,
            decrease_ratio: 0.9,
            increase_ratio: 1.1,
            jitter_ratio: 0.05,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        let factors = [self.min_factor, self.default_factor, self.max_factor];
        if factors.iter().any(|f| !f.is_finite() || *f <= 0.0) {
            return Err("scheduler factors must be positive".to_string());
        }
        if !(self.min_factor < self.default_factor && self.default_factor < self.max_factor) {
            return Err(format!(
                "scheduler factors must satisfy min < default < max (got {} / {} / {})",
                self.min_factor, self.default_factor, self.max_factor
            ));
        }
        if !(self.decrease_ratio > 0.0 && self.decrease_ratio < 1.0) {
            return Err("decrease_ratio must be in (0, 1)".to_string());
        }
        if !(self.increase_ratio > 1.0 && self.increase_ratio.is_finite()) {
            return Err("increase_ratio must be greater than 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err("jitter_ratio must be in [0, 1]".to_string());
        }
        Ok(())
    }
}

/// How an upload cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Uploaded at least one batch and more are waiting
    MoreRemaining,

    /// Nothing left to upload
    Drained,

    /// A retryable failure stopped the cycle
    Failed,
}

/// Computes the delay before the next cycle
#[derive(Debug)]
pub struct UploadScheduler {
    min_delay: Duration,
    default_delay: Duration,
    max_delay: Duration,
    current: Duration,
    decrease_ratio: f64,
    increase_ratio: f64,
    jitter_ratio: f64,
    rng: StdRng,
}

impl UploadScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::build(config.frequency.base_step(), config, StdRng::from_entropy())
    }

    /// Deterministic jitter
    pub fn with_seed(config: &SchedulerConfig, seed: u64) -> Self {
        Self::build(config.frequency.base_step(), config, StdRng::seed_from_u64(seed))
    }

    /// Custom base step instead of the configured frequency
    pub fn with_step(step: Duration, config: &SchedulerConfig, seed: u64) -> Self {
        Self::build(step, config, StdRng::seed_from_u64(seed))
    }

    fn build(step: Duration, config: &SchedulerConfig, rng: StdRng) -> Self {
        let default_delay = step.mul_f64(config.default_factor);

        Self {
            min_delay: step.mul_f64(config.min_factor),
            default_delay,
            max_delay: step.mul_f64(config.max_factor),
            current: default_delay,
            decrease_ratio: config.decrease_ratio,
            increase_ratio: config.increase_ratio,
            jitter_ratio: config.jitter_ratio,
            rng,
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Fold a cycle's outcome into the delay and return the new delay
    pub fn on_outcome(&mut self, outcome: CycleOutcome) -> Duration {
        let next = match outcome {
            CycleOutcome::MoreRemaining => self.current.mul_f64(self.decrease_ratio),
            CycleOutcome::Drained | CycleOutcome::Failed => {
                let jitter = self
                    .current
                    .mul_f64(self.jitter_ratio * self.rng.gen::<f64>());
                self.current.mul_f64(self.increase_ratio) + jitter
            }
        };

        self.current = next.clamp(self.min_delay, self.max_delay);
        trace!("Next upload in {:?} after {:?}", self.current, outcome);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.default_delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn step_config(frequency: UploadFrequency) -> SchedulerConfig {
        SchedulerConfig {
            frequency,
            ..Default::default()
        }
    }

    #[test]
    fn test_bounds() {
        let scheduler = UploadScheduler::with_seed(&step_config(UploadFrequency::Average), 1);
        assert_eq!(scheduler.min_delay(), Duration::from_millis(1_000));
        assert_eq!(scheduler.default_delay(), Duration::from_millis(2_000));
        assert_eq!(scheduler.max_delay(), Duration::from_millis(20_000));
        assert_eq!(scheduler.current_delay(), scheduler.default_delay());
    }

    #[test]
    fn test_failures_back_off_up_to_max() {
        let config = SchedulerConfig::default();
        let mut scheduler = UploadScheduler::with_step(Duration::from_millis(1_000), &config, 7);
        assert_eq!(scheduler.current_delay(), Duration::from_millis(1_000));

        let mut previous = scheduler.current_delay();
        for _ in 0..3 {
            let next = scheduler.on_outcome(CycleOutcome::Failed);
            assert!(next > previous);
            assert!(next <= Duration::from_millis(10_000));
            previous = next;
        }

        for _ in 0..100 {
            scheduler.on_outcome(CycleOutcome::Failed);
        }
        assert_eq!(scheduler.current_delay(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_backlog_drains_faster_down_to_min() {
        let mut scheduler = UploadScheduler::with_seed(&step_config(UploadFrequency::Frequent), 3);

        let first = scheduler.on_outcome(CycleOutcome::MoreRemaining);
        assert!(first < scheduler.default_delay());

        for _ in 0..100 {
            scheduler.on_outcome(CycleOutcome::MoreRemaining);
        }
        assert_eq!(scheduler.current_delay(), scheduler.min_delay());

        scheduler.reset();
        assert_eq!(scheduler.current_delay(), scheduler.default_delay());
    }

    #[test]
    fn test_idle_backs_off() {
        let mut scheduler = UploadScheduler::with_seed(&step_config(UploadFrequency::Rare), 11);
        let next = scheduler.on_outcome(CycleOutcome::Drained);
        assert!(next > scheduler.default_delay());
    }

    #[test]
    fn test_validate() {
        assert!(SchedulerConfig::default().validate().is_ok());

        let inverted = SchedulerConfig {
            min_factor: 2.0,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let no_growth = SchedulerConfig {
            increase_ratio: 1.0,
            ..Default::default()
        };
        assert!(no_growth.validate().is_err());
    }

    proptest! {
        #[test]
        fn delay_stays_in_bounds(seed in any::<u64>(), outcomes in proptest::collection::vec(0u8..3, 0..64)) {
            let mut scheduler = UploadScheduler::with_seed(&SchedulerConfig::default(), seed);
            for o in outcomes {
                let outcome = match o {
                    0 => CycleOutcome::MoreRemaining,
                    1 => CycleOutcome::Drained,
                    _ => CycleOutcome::Failed,
                };
                let delay = scheduler.on_outcome(outcome);
                prop_assert!(delay >= scheduler.min_delay());
                prop_assert!(delay <= scheduler.max_delay());
            }
        }
    }
}
