//! Exponential backoff for retryable handler errors.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

/// Retry policy for retryable (`NET_*`, `TIMEOUT_OPERATION`) errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    /// Jitter fraction applied to each delay (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: 3,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubled per attempt
    /// up to the cap, with jitter applied.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let base = self
            .initial_backoff
            .saturating_mul(factor as u32)
            .min(self.max_backoff);

        let spread = (base.as_millis() as f64 * self.jitter) as i64;
        if spread == 0 {
            return base;
        }
        let offset = jitter_entropy(spread);
        let millis = (base.as_millis() as i64 + offset).max(0) as u64;
        Duration::from_millis(millis)
    }

    /// Sleep out the backoff; returns `true` when cancelled mid-wait.
    pub async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.backoff_delay(attempt)) => false,
            _ = cancel.cancelled() => true,
        }
    }
}

/// Jitter offset in `[-spread, +spread]`, derived from sub-microsecond clock
/// entropy (the stack carries no rng).
fn jitter_entropy(spread: i64) -> i64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.subsec_nanos() as i64);
    (nanos % (2 * spread + 1)) - spread
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(6), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(30), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for attempt in 1..=5 {
            let base = RetryPolicy {
                jitter: 0.0,
                ..policy.clone()
            }
            .backoff_delay(attempt);
            let delay = policy.backoff_delay(attempt);
            let low = base.mul_f64(0.74);
            let high = base.mul_f64(1.26);
            assert!(delay >= low && delay <= high, "attempt {attempt}: {delay:?}");
        }
    }

    #[tokio::test]
    async fn test_wait_observes_cancellation() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(policy.wait(1, &cancel).await);
    }
}
