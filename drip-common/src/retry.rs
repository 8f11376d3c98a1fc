//! Exponential backoff schedules shared by the transport clients and the
//! scheduler's job-level retries.

use std::time;

use rand::Rng;

/// Determines how long to wait before attempt `n + 1` after attempt `n`
/// failed. Intervals grow geometrically from `initial_interval`, are capped
/// by `maximum_interval`, and get a uniform ± `jitter` fraction applied so
/// synchronized retries spread out.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        jitter: f64,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            jitter,
        }
    }

    /// The interval to wait after `attempt` (1-based) has failed.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);
        let candidate_interval =
            self.initial_interval * self.backoff_coefficient.saturating_pow(exponent);

        let capped = match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        };

        if self.jitter <= 0.0 {
            return capped;
        }

        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        capped.mul_f64(1.0 + spread)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: Some(time::Duration::from_secs(30)),
            jitter: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intervals_double_without_jitter() {
        let policy = RetryPolicy::new(2, time::Duration::from_secs(1), None, 0.0);

        assert_eq!(policy.time_until_next_retry(1), time::Duration::from_secs(1));
        assert_eq!(policy.time_until_next_retry(2), time::Duration::from_secs(2));
        assert_eq!(policy.time_until_next_retry(3), time::Duration::from_secs(4));
    }

    #[test]
    fn test_maximum_interval_caps_growth() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(1),
            Some(time::Duration::from_secs(30)),
            0.0,
        );

        assert_eq!(
            policy.time_until_next_retry(10),
            time::Duration::from_secs(30)
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(2, time::Duration::from_secs(10), None, 0.1);

        for _ in 0..1_000 {
            let interval = policy.time_until_next_retry(1);
            assert!(interval >= time::Duration::from_secs(9));
            assert!(interval <= time::Duration::from_secs(11));
        }
    }

    #[test]
    fn test_jitter_applies_after_cap() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(1),
            Some(time::Duration::from_secs(30)),
            0.2,
        );

        for _ in 0..1_000 {
            let interval = policy.time_until_next_retry(12);
            assert!(interval <= time::Duration::from_secs(36));
            assert!(interval >= time::Duration::from_secs(24));
        }
    }
}
