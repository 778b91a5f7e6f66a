//! Exponential backoff with jitter for task retries.

use std::time::Duration;

use rand::Rng;

/// Retry delay policy: `base * 2^(attempt-1)`, capped, with a random
/// jitter factor applied so failed tasks do not stampede back in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay used as the jitter half-width, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(15 * 60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next run of a task that has now failed `attempt`
    /// times (`attempt >= 1`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let raw = self.base.as_secs_f64() * f64::from(2u32.saturating_pow(exp).min(1 << 30));
        let capped = raw.min(self.cap.as_secs_f64());

        let jitter = capped * self.jitter;
        let offset = if jitter > 0.0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempts_and_stays_in_bounds() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(900),
            jitter: 0.2,
        };

        for attempt in 1..=10 {
            let nominal = (10.0 * 2f64.powi(attempt as i32 - 1)).min(900.0);
            let d = policy.delay(attempt).as_secs_f64();
            assert!(d >= nominal * 0.8 - 1e-9, "attempt {attempt}: {d} too small");
            assert!(d <= nominal * 1.2 + 1e-9, "attempt {attempt}: {d} too large");
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(60),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(5), Duration::from_secs(60));
        assert_eq!(policy.delay(30), Duration::from_secs(60));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        assert!(policy.delay(u32::MAX) <= Duration::from_secs(18 * 60));
    }
}
