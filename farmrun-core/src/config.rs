//! Run tuning and ledger-call configuration.
//!
//! The observed deployments disagreed on the accepted time window, so the
//! duration and buffer are configuration rather than constants. Every field
//! has a serde default so partial config files stay valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Tunable parameters for the run pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Dungeon used when a start request omits one.
    #[serde(default = "RunConfig::default_dungeon")]
    pub default_dungeon_id: String,
    /// Expected run length in seconds.
    #[serde(default = "RunConfig::default_run_duration_sec")]
    pub run_duration_sec: u32,
    /// Tolerance around the run duration for network and latency slack.
    #[serde(default = "RunConfig::default_time_buffer_sec")]
    pub time_buffer_sec: u32,
    /// Minimal sane elapsed time; anything below is rejected outright.
    #[serde(default = "RunConfig::default_min_elapsed_sec")]
    pub min_elapsed_sec: u32,
    /// Currency item granted on every successful run.
    #[serde(default = "RunConfig::default_base_reward_item")]
    pub base_reward_item: String,
    /// Amount of the base currency grant.
    #[serde(default = "RunConfig::default_base_reward_amount")]
    pub base_reward_amount: i64,
    /// Hard per-call operation ceiling imposed by the ledger.
    #[serde(default = "RunConfig::default_max_ops_per_call")]
    pub max_ops_per_call: usize,
    /// Timeout for a single ledger call, in milliseconds.
    #[serde(default = "RunConfig::default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Retries allowed per batch for transient ledger failures.
    #[serde(default = "RunConfig::default_max_transient_retries")]
    pub max_transient_retries: u32,
    /// Base backoff before a retry, in milliseconds; doubles per attempt.
    #[serde(default = "RunConfig::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl RunConfig {
    fn default_dungeon() -> String {
        "DUNGEON_FARM_01".to_string()
    }
    const fn default_run_duration_sec() -> u32 {
        300
    }
    const fn default_time_buffer_sec() -> u32 {
        10
    }
    const fn default_min_elapsed_sec() -> u32 {
        1
    }
    fn default_base_reward_item() -> String {
        "CURRENCY_GOLD".to_string()
    }
    const fn default_base_reward_amount() -> i64 {
        100
    }
    const fn default_max_ops_per_call() -> usize {
        50
    }
    const fn default_call_timeout_ms() -> u64 {
        5_000
    }
    const fn default_max_transient_retries() -> u32 {
        2
    }
    const fn default_retry_backoff_ms() -> u64 {
        200
    }

    /// Per-call ledger timeout as a [`Duration`].
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Base retry backoff as a [`Duration`].
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Validate cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns `RunConfigError` when any field violates the documented bounds.
    pub fn validate(&self) -> Result<(), RunConfigError> {
        if self.run_duration_sec == 0 {
            return Err(RunConfigError::MinViolation {
                field: "run_duration_sec",
                min: 1,
                value: u64::from(self.run_duration_sec),
            });
        }
        if self.time_buffer_sec >= self.run_duration_sec {
            return Err(RunConfigError::BufferExceedsDuration {
                buffer: self.time_buffer_sec,
                duration: self.run_duration_sec,
            });
        }
        if self.base_reward_amount <= 0 {
            return Err(RunConfigError::NonPositiveBaseReward {
                amount: self.base_reward_amount,
            });
        }
        if self.max_ops_per_call == 0 {
            return Err(RunConfigError::MinViolation {
                field: "max_ops_per_call",
                min: 1,
                value: 0,
            });
        }
        if self.call_timeout_ms == 0 {
            return Err(RunConfigError::MinViolation {
                field: "call_timeout_ms",
                min: 1,
                value: 0,
            });
        }
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_dungeon_id: Self::default_dungeon(),
            run_duration_sec: Self::default_run_duration_sec(),
            time_buffer_sec: Self::default_time_buffer_sec(),
            min_elapsed_sec: Self::default_min_elapsed_sec(),
            base_reward_item: Self::default_base_reward_item(),
            base_reward_amount: Self::default_base_reward_amount(),
            max_ops_per_call: Self::default_max_ops_per_call(),
            call_timeout_ms: Self::default_call_timeout_ms(),
            max_transient_retries: Self::default_max_transient_retries(),
            retry_backoff_ms: Self::default_retry_backoff_ms(),
        }
    }
}

/// Errors raised when run configuration invariants are violated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunConfigError {
    #[error("{field} must be at least {min} (got {value})")]
    MinViolation {
        field: &'static str,
        min: u64,
        value: u64,
    },
    #[error("time buffer {buffer}s must be smaller than run duration {duration}s")]
    BufferExceedsDuration { buffer: u32, duration: u32 },
    #[error("base reward amount must be positive (got {amount})")]
    NonPositiveBaseReward { amount: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RunConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RunConfig::default());
        assert_eq!(cfg.max_ops_per_call, 50);
        assert_eq!(cfg.call_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn buffer_must_stay_under_duration() {
        let cfg = RunConfig {
            run_duration_sec: 30,
            time_buffer_sec: 30,
            ..RunConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(RunConfigError::BufferExceedsDuration {
                buffer: 30,
                duration: 30
            })
        );
    }

    #[test]
    fn zero_batch_limit_rejected() {
        let cfg = RunConfig {
            max_ops_per_call: 0,
            ..RunConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(RunConfigError::MinViolation {
                field: "max_ops_per_call",
                ..
            })
        ));
    }
}
