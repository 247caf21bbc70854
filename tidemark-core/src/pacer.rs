//! Request pacing, boundary waits and retry backoff.
//!
//! All suspension in a recorder goes through a `Sleeper`, so tests can swap in
//! `RecordingSleeper` and run passes without waiting on wall time.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Records requested sleeps instead of performing them.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }

    pub fn total(&self) -> Duration {
        self.slept.lock().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in [0.5, 1.0].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_retries
    }
}

pub struct Pacer {
    sleeper: Arc<dyn Sleeper>,
    sleeping_time: Duration,
    max_boundary_wait: Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Pacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pacer")
            .field("sleeping_time", &self.sleeping_time)
            .field("max_boundary_wait", &self.max_boundary_wait)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Pacer {
    pub fn new(
        sleeper: Arc<dyn Sleeper>,
        sleeping_time: Duration,
        max_boundary_wait: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sleeper,
            sleeping_time,
            max_boundary_wait,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Minimum gap between two entities' requests.
    pub fn pace(&self) {
        if !self.sleeping_time.is_zero() {
            self.sleeper.sleep(self.sleeping_time);
        }
    }

    /// Sleep once until a period boundary if it is close enough.
    ///
    /// Returns whether the wait happened.
    pub fn wait_for_boundary(&self, wait: Duration) -> bool {
        if wait.is_zero() || wait > self.max_boundary_wait {
            return false;
        }
        tracing::debug!(wait_ms = wait.as_millis() as u64, "waiting for period boundary");
        self.sleeper.sleep(wait);
        true
    }

    /// Sleep before retry number `attempt`, never shorter than `at_least`.
    pub fn backoff(&self, attempt: u32, at_least: Option<Duration>) -> Duration {
        let mut delay = self.retry.delay_for(attempt);
        if self.retry.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay = delay.mul_f64(factor);
        }
        if let Some(floor) = at_least {
            delay = delay.max(floor);
        }
        self.sleeper.sleep(delay);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(retry: RetryPolicy) -> (Pacer, Arc<RecordingSleeper>) {
        let rec = Arc::new(RecordingSleeper::new());
        let pacer = Pacer::new(
            rec.clone(),
            Duration::from_millis(250),
            Duration::from_secs(60),
            retry,
        );
        (pacer, rec)
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
        assert!(!policy.exhausted(5));
        assert!(policy.exhausted(6));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            ..RetryPolicy::default()
        };
        let (pacer, _) = pacer(retry);
        for _ in 0..50 {
            let d = pacer.backoff(1, None);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn backoff_respects_floor() {
        let retry = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let (pacer, rec) = pacer(retry);
        let d = pacer.backoff(1, Some(Duration::from_secs(30)));
        assert_eq!(d, Duration::from_secs(30));
        assert_eq!(rec.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[test]
    fn boundary_wait_is_bounded() {
        let (pacer, rec) = pacer(RetryPolicy::default());
        assert!(pacer.wait_for_boundary(Duration::from_secs(10)));
        assert!(!pacer.wait_for_boundary(Duration::from_secs(3600)));
        assert_eq!(rec.sleeps(), vec![Duration::from_secs(10)]);
    }

    #[test]
    fn pace_sleeps_configured_gap() {
        let (pacer, rec) = pacer(RetryPolicy::default());
        pacer.pace();
        pacer.pace();
        assert_eq!(rec.total(), Duration::from_millis(500));
    }
}
