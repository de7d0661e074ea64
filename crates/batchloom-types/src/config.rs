//! Scheduler configuration types.
//!
//! `SchedulerConfig` mirrors `batchloom.toml` in the data directory. Every
//! field has a default so a partial (or empty) file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub transactions: TransactionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub events: EventConfig,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        self.transactions.validate()?;
        if self.execution.capacity == 0 {
            return Err(SchedulerError::Config(
                "execution.capacity must be at least 1".into(),
            ));
        }
        if self.events.capacity == 0 {
            return Err(SchedulerError::Config(
                "events.capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Retry policy of the unit-of-work runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Additional attempts after the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after every failed attempt.
    #[serde(default = "default_damping_factor")]
    pub damping_factor: f64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_damping_factor() -> f64 {
    2.0
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            damping_factor: default_damping_factor(),
        }
    }
}

impl TransactionConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.initial_delay_ms == 0 {
            return Err(SchedulerError::Config(
                "transactions.initial_delay_ms must be greater than 0".into(),
            ));
        }
        if !self.damping_factor.is_finite() || self.damping_factor < 1.0 {
            return Err(SchedulerError::Config(format!(
                "transactions.damping_factor must be >= 1, got {}",
                self.damping_factor
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Deadline for tasks that do not declare their own.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// After an interrupt, how long an executable may take to unwind before
    /// it is dropped. `None` waits for the cooperative unwind indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_grace_ms: Option<u64>,
    /// Concurrent execution slots of the local allocator.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_capacity() -> usize {
    4
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            kill_grace_ms: None,
            capacity: default_capacity(),
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn kill_grace(&self) -> Option<Duration> {
        self.kill_grace_ms.map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Restart
// ---------------------------------------------------------------------------

/// Delay before a faulty task is executed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_restart_initial_ms")]
    pub initial_delay_ms: u64,
    /// Added `n` times for the n-th re-execution.
    #[serde(default = "default_restart_step_ms")]
    pub step_ms: u64,
    #[serde(default = "default_restart_max_ms")]
    pub max_delay_ms: u64,
}

fn default_restart_initial_ms() -> u64 {
    1000
}

fn default_restart_step_ms() -> u64 {
    1000
}

fn default_restart_max_ms() -> u64 {
    60_000
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_restart_initial_ms(),
            step_ms: default_restart_step_ms(),
            max_delay_ms: default_restart_max_ms(),
        }
    }
}

impl RestartConfig {
    /// No delay between re-executions.
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            step_ms: 0,
            max_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: SchedulerConfig = toml::from_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.transactions.max_retries, 5);
        assert_eq!(config.execution.capacity, 4);
        assert_eq!(config.restart.max_delay_ms, 60_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config: SchedulerConfig = toml::from_str(
            r#"
[transactions]
max_retries = 2
damping_factor = 3.0

[execution]
kill_grace_ms = 500
"#,
        )
        .unwrap();
        assert_eq!(config.transactions.max_retries, 2);
        assert_eq!(config.transactions.initial_delay_ms, 100);
        assert_eq!(config.execution.kill_grace(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn damping_below_one_is_rejected() {
        let config = TransactionConfig {
            damping_factor: 0.5,
            ..TransactionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_initial_delay_is_rejected() {
        let config = TransactionConfig {
            initial_delay_ms: 0,
            ..TransactionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
