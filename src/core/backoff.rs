//! Reconnect backoff schedule.

use std::time::Duration;

use crate::config::BackendConfig;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetrySchedule {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_backoff_ms),
            ..Self::default()
        }
    }

    /// delay = min(base_delay * 2^(attempt-1), max_delay)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }
}
