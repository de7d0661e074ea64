//! Delay before a faulty task is executed again.

use std::time::Duration;

use batchloom_types::config::RestartConfig;

/// Beyond this many executions the maximum delay applies.
const MAX_GROWTH_STEPS: u32 = 10;

/// Growing re-execution delay.
///
/// `wait(0) = initial`, `wait(n) = wait(n - 1) + n * step`, and
/// `wait(n) = max` once `n` exceeds ten. The result never exceeds `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    initial: Duration,
    step: Duration,
    max: Duration,
}

impl RestartPolicy {
    pub fn new(initial: Duration, step: Duration, max: Duration) -> Self {
        Self { initial, step, max }
    }

    pub fn from_config(config: &RestartConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.step_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Restart immediately.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the execution following `executions` failed ones.
    pub fn waiting_time(&self, executions: u32) -> Duration {
        if executions > MAX_GROWTH_STEPS {
            return self.max;
        }
        let triangular = executions * (executions + 1) / 2;
        let wait = self.initial + self.step * triangular;
        wait.min(self.max)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&RestartConfig::default())
    }
}
