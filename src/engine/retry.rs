use crate::error::TransportError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Bounded retry for transient transport failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. 0 and 1 both mean "no retry".
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub backoff: Backoff,
    pub jitter_pct: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::Exponential,
            jitter_pct: 0.20,
        }
    }
}

impl RetryPolicy {
    #[cfg(test)]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt_no` (1-based).
    pub fn delay_for(&self, attempt_no: u32, rng: &mut impl Rng) -> Duration {
        let attempt_no = attempt_no.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                // 2^(attempt-1), saturating; the cap below handles huge values.
                let pow2 = 1_u32.checked_shl(attempt_no - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(pow2)
            }
        };
        let delay = delay.min(self.max_delay);

        let jitter_pct = self.jitter_pct.clamp(0.0, 1.0);
        if jitter_pct == 0.0 || delay.is_zero() {
            return delay;
        }
        let secs = delay.as_secs_f64();
        let jitter_range = secs * jitter_pct;
        let jittered = secs + rng.gen_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

/// Run `op`, retrying retryable failures according to `policy`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt, &mut rand::thread_rng());
                tracing::debug!(
                    op = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
