use std::time::Duration;

use rand::Rng;

use atlas_common::GraphSettings;

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &GraphSettings) -> Self {
        Self {
            max_attempts: settings.store_max_attempts.max(1),
            base: settings.store_retry_base,
        }
    }

    /// Delay before retrying after failed attempt `attempt` (zero-based):
    /// `base * 3^attempt` plus up to one `base` of jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff = self.base * 3u32.pow(attempt.min(6));
        let jitter_ms = self.base.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };
        backoff + jitter
    }

    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.backoff(attempt)).await;
    }
}
