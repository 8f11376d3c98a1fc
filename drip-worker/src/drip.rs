//! The drip gate: a token bucket with capacity one, refilled at one token
//! per interval.

use std::time;

use tokio::time::Instant;

/// Enforces the minimum spacing between the *starts* of consecutive job
/// executions. `wait_ready` blocks until a full interval has elapsed since
/// the last `mark_start`; when an execution overruns the interval, the next
/// one may start immediately, but never more than one token accrues, so a
/// slow job is not followed by a burst of catch-up starts.
pub struct DripGate {
    interval: time::Duration,
    not_before: Option<Instant>,
}

impl DripGate {
    pub fn new(interval: time::Duration) -> Self {
        Self {
            interval,
            not_before: None,
        }
    }

    /// Wait until the next execution is allowed to start.
    pub async fn wait_ready(&self) {
        if let Some(not_before) = self.not_before {
            tokio::time::sleep_until(not_before).await;
        }
    }

    /// Record that an execution is starting now, pushing the next allowed
    /// start one interval out.
    pub fn mark_start(&mut self) {
        self.not_before = Some(Instant::now() + self.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: time::Duration = time::Duration::from_millis(100);

    #[tokio::test]
    async fn test_first_start_is_immediate() {
        let gate = DripGate::new(INTERVAL);

        let begin = Instant::now();
        gate.wait_ready().await;
        assert!(begin.elapsed() < time::Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_consecutive_starts_are_spaced() {
        let mut gate = DripGate::new(INTERVAL);

        let begin = Instant::now();
        for _ in 0..3 {
            gate.wait_ready().await;
            gate.mark_start();
        }
        assert!(begin.elapsed() >= INTERVAL * 2);
    }

    #[tokio::test]
    async fn test_slow_execution_does_not_burst() {
        let mut gate = DripGate::new(INTERVAL);

        gate.wait_ready().await;
        gate.mark_start();

        // Simulate an execution that overruns the interval.
        tokio::time::sleep(INTERVAL * 2).await;

        // The next start is immediate (no extra wait)...
        let begin = Instant::now();
        gate.wait_ready().await;
        gate.mark_start();
        assert!(begin.elapsed() < time::Duration::from_millis(20));

        // ...but only one token accrued: the start after that waits a full
        // interval again.
        let begin = Instant::now();
        gate.wait_ready().await;
        assert!(begin.elapsed() >= INTERVAL - time::Duration::from_millis(5));
    }
}
