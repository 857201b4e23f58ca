//! Bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::Result;

/// Retry policy: `attempts` tries, delays doubling from `base` up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            max,
        }
    }

    /// Delay before retry number `attempt` (0-based), with up to 25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let raw = self.base.saturating_mul(factor).min(self.max);
        let jitter_ms = (raw.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return raw;
        }
        raw + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.delay(attempt);
                    debug!(operation = what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after transient error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(20), Duration::from_secs(1))
    }
}
