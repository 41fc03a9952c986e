//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the orchestration engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub dispatch: DispatchConfig,
    pub watchdog: WatchdogConfig,
    /// Buffer size of the in-process event bus.
    pub event_capacity: usize,
}

impl SchedulerConfig {
    pub fn event_capacity(&self) -> usize {
        if self.event_capacity == 0 {
            1024
        } else {
            self.event_capacity
        }
    }
}

/// Retry policy for handing jobs to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Attempts before a job is failed with `dispatch_error`.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long to wait for an agent acknowledgement.
    pub ack_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            ack_timeout_ms: 5_000,
        }
    }
}

impl DispatchConfig {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Watchdog for job instances that stop reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// A non-terminal job with no update for this long is failed.
    pub job_timeout_secs: u64,
    pub scan_interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 3600,
            scan_interval_secs: 15,
        }
    }
}

impl WatchdogConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = DispatchConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"dispatch": {"max_attempts": 2}}"#).unwrap();
        assert_eq!(config.dispatch.max_attempts, 2);
        assert_eq!(config.dispatch.ack_timeout_ms, 5_000);
        assert_eq!(config.watchdog.job_timeout_secs, 3600);
        assert_eq!(config.event_capacity(), 1024);
    }
}
