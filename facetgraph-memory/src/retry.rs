//! Exponential backoff for transient backend failures

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::Result;

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay_ms`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let jitter = (base * 0.1 * jitter(attempt)) as u64;
        let delay = (base as u64).saturating_add(jitter);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Deterministic jitter in [0, 1) derived from the attempt number
fn jitter(attempt: u32) -> f64 {
    let x = attempt.wrapping_mul(2654435761);
    (x % 100) as f64 / 100.0
}

/// Run `op`, retrying transient errors with backoff. Other errors and the
/// final transient one are returned as is.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = config.delay_for(attempt);
                log::warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    what,
                    attempt + 1,
                    attempts,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
