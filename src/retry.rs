use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::{ProviderStatus, SearchError};

const MAX_BACKOFF_EXPONENT: u32 = 6;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.search_max_attempts.max(1),
            base_delay: Duration::from_millis(config.search_backoff_ms),
            attempt_timeout: config.request_timeout(),
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Each attempt is bounded by `attempt_timeout`.
    pub async fn run<T, F, Fut>(&self, provider: &'static str, mut op: F) -> Result<T, SearchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SearchError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(SearchError::new(
                    provider,
                    ProviderStatus::Timeout,
                    format!("no response within {:?}", self.attempt_timeout),
                )),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        target: "retry",
                        provider,
                        status = %err.status,
                        attempt,
                        "request failed; retrying after {:?}", delay
                    );
                    sleep(delay).await;
                }
                Err(mut err) => {
                    err.attempts = attempt;
                    return Err(err);
                }
            }
        }
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let base = self.base_delay * (1 << exponent);
        let jitter_cap = self.base_delay.as_millis() as u64 / 2;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        base + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}
