//! Retry helpers
//!
//! Two shapes are used across the daemon:
//!
//! - [`Backoff`]: capped exponential delays with jitter, for unbounded
//!   reconnection.
//! - [`ShrinkPolicy`] + [`shrink_until`]: a bounded loop that re-runs an
//!   operation with progressively smaller parameters until the result is
//!   acceptable (used to fit oversize payloads into a frame).

use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
}

impl Backoff {
    /// Create a backoff policy from millisecond bounds
    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms.max(base_ms)),
        }
    }

    /// Delay for a 0-indexed attempt, without jitter
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(exp.min(self.max.as_millis() as u64))
    }

    /// Delay for a 0-indexed attempt with ±25% jitter, never above the cap
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt).as_millis() as u64;
        let spread = nominal / 4;
        if spread == 0 {
            return Duration::from_millis(nominal);
        }
        let jittered = nominal - spread + rand::thread_rng().gen_range(0..=spread * 2);
        Duration::from_millis(jittered.min(self.max.as_millis() as u64))
    }
}

/// Policy for [`shrink_until`]
pub struct ShrinkPolicy<P, R> {
    /// Total attempts, including the first one with the original parameters
    pub max_attempts: u32,
    /// Produce smaller parameters for the next attempt
    pub shrink: Box<dyn Fn(P) -> P + Send + Sync>,
    /// Whether an attempt's result is good enough
    pub accept: Box<dyn Fn(&R) -> bool + Send + Sync>,
}

/// Outcome of a shrink loop
#[derive(Debug)]
pub enum ShrinkOutcome<R> {
    /// An attempt was accepted
    Accepted { result: R, attempts: u32 },
    /// Every attempt was rejected; carries the last result
    Exhausted { last: R, attempts: u32 },
}

impl<R> ShrinkOutcome<R> {
    /// The accepted result, if any
    pub fn accepted(self) -> Option<R> {
        match self {
            ShrinkOutcome::Accepted { result, .. } => Some(result),
            ShrinkOutcome::Exhausted { .. } => None,
        }
    }
}

/// Run `attempt` with shrinking parameters until `policy.accept` holds.
///
/// Errors from `attempt` are returned immediately; only rejected results
/// lead to another (smaller) attempt.
pub fn shrink_until<P, R, E, F>(
    policy: &ShrinkPolicy<P, R>,
    params: P,
    mut attempt: F,
) -> Result<ShrinkOutcome<R>, E>
where
    P: Clone,
    F: FnMut(&P) -> Result<R, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut current = params;
    let mut n = 0;
    loop {
        n += 1;
        let result = attempt(&current)?;
        if (policy.accept)(&result) {
            return Ok(ShrinkOutcome::Accepted {
                result,
                attempts: n,
            });
        }
        if n >= max_attempts {
            return Ok(ShrinkOutcome::Exhausted {
                last: result,
                attempts: n,
            });
        }
        tracing::debug!(attempt = n, "Result rejected, shrinking parameters");
        current = (policy.shrink)(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::from_millis(1000, 30_000);
        assert_eq!(backoff.nominal_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.nominal_delay(1), Duration::from_millis(2000));
        assert_eq!(backoff.nominal_delay(4), Duration::from_millis(16_000));
        assert_eq!(backoff.nominal_delay(5), Duration::from_millis(30_000));
        assert_eq!(backoff.nominal_delay(60), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let backoff = Backoff::from_millis(1000, 30_000);
        for attempt in 0..10 {
            let nominal = backoff.nominal_delay(attempt);
            let d = backoff.delay(attempt);
            assert!(d >= nominal - nominal / 4);
            assert!(d <= Duration::from_millis(30_000));
        }
    }

    fn halving_policy(limit: usize) -> ShrinkPolicy<usize, String> {
        ShrinkPolicy {
            max_attempts: 4,
            shrink: Box::new(|n| n / 2),
            accept: Box::new(move |s: &String| s.len() <= limit),
        }
    }

    #[test]
    fn test_shrink_until_accepts_after_shrinking() {
        let policy = halving_policy(10);
        let outcome = shrink_until::<_, _, (), _>(&policy, 40, |n| Ok("x".repeat(*n))).unwrap();
        match outcome {
            ShrinkOutcome::Accepted { result, attempts } => {
                assert_eq!(result.len(), 10);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_shrink_until_exhausts() {
        let policy = halving_policy(1);
        let outcome = shrink_until::<_, _, (), _>(&policy, 400, |n| Ok("x".repeat(*n))).unwrap();
        assert!(matches!(
            outcome,
            ShrinkOutcome::Exhausted { attempts: 4, .. }
        ));
    }

    #[test]
    fn test_shrink_until_propagates_errors() {
        let policy = halving_policy(1);
        let result = shrink_until(&policy, 4, |_| Err::<String, _>("boom"));
        assert_eq!(result.unwrap_err(), "boom");
    }
}
