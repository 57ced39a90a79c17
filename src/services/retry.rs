//! Bounded retry with randomized backoff for conditional-write loops

use std::time::Duration;

use rand::Rng;

use crate::config::LendingConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    jitter_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, jitter_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter_ms,
        }
    }

    pub fn from_config(config: &LendingConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
            config.backoff_jitter_ms,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (0-based): exponential base plus jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.saturating_mul(1u32 << attempt.min(10));
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        exponential + Duration::from_millis(jitter)
    }

    /// Sleep before retrying, unless `attempt` was the last one
    pub async fn backoff(&self, attempt: u32) {
        if attempt + 1 >= self.max_attempts {
            return;
        }
        let delay = self.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&LendingConfig::default())
    }
}
