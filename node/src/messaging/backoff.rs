use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter between queue drain attempts.
///
/// There is no attempt cap: a queued message is retried until it is delivered
/// or the queue is cleared.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add random jitter to each delay (±30%)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = (self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(exponent))
        .min(self.max_backoff.as_millis() as f64);

        let delay_ms = if self.jitter {
            let jitter_factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
            base_ms * jitter_factor
        } else {
            base_ms
        };
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_up_to_cap() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_thirty_percent() {
        let policy = RetryPolicy::default();
        for attempt in 1..6 {
            let base = RetryPolicy {
                jitter: false,
                ..Default::default()
            }
            .delay_for(attempt)
            .as_millis() as f64;
            let delay = policy.delay_for(attempt).as_millis() as f64;
            assert!(delay >= base * 0.7 - 1.0 && delay <= base * 1.3 + 1.0);
        }
    }
}
