//! Bounded polling with backoff.
//!
//! Every wait in the harness (node liveness after launch, transaction confirmation,
//! chain-height convergence) is expressed as a single call to [poll], which never
//! blocks longer than the provided timeout.

use std::{future::Future, time::Duration};
use tokio::time::{sleep, timeout, Instant};

/// Delay schedule between polling attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failed attempt
    pub initial: Duration,

    /// Upper bound on any single delay
    pub max: Duration,

    /// Multiplier applied to the delay after each failed attempt
    pub factor: u32,
}

impl Backoff {
    /// Wait the same interval between every attempt.
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            factor: 1,
        }
    }

    /// Double the delay after every attempt, starting at `initial` and capped at `max`.
    pub const fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            factor: 2,
        }
    }

    /// Returns the delay that follows `current`.
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(self.factor).min(self.max)
    }
}

/// Invoke `attempt` until it yields `Some`, sleeping between attempts according to `backoff`.
///
/// At least one attempt is always made. An attempt still in flight when `limit` elapses
/// is abandoned. Returns `None` once `limit` has elapsed without success.
pub async fn poll<T, F, Fut>(limit: Duration, backoff: Backoff, mut attempt: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + limit;
    let mut delay = backoff.initial;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, attempt()).await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {}
            Err(_) => return None,
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        sleep(delay.min(remaining)).await;
        delay = backoff.next(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn test_backoff_schedule() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(350));
        let mut delay = backoff.initial;
        let mut schedule = Vec::new();
        for _ in 0..4 {
            schedule.push(delay.as_millis());
            delay = backoff.next(delay);
        }
        assert_eq!(schedule, vec![100, 200, 350, 350]);

        let fixed = Backoff::fixed(Duration::from_secs(5));
        assert_eq!(fixed.next(fixed.initial), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_succeeds_after_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let result = poll(
            Duration::from_secs(60),
            Backoff::fixed(Duration::from_secs(5)),
            || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    (n == 3).then_some(n)
                }
            },
        )
        .await;
        assert_eq!(result, Some(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_gives_up_at_limit() {
        let start = Instant::now();
        let result: Option<()> = poll(
            Duration::from_secs(12),
            Backoff::fixed(Duration::from_secs(5)),
            || async { None },
        )
        .await;
        assert!(result.is_none());
        assert_eq!(start.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_abandons_hung_attempt() {
        let start = Instant::now();
        let result: Option<()> = poll(
            Duration::from_secs(3),
            Backoff::fixed(Duration::from_secs(1)),
            || async {
                sleep(Duration::from_secs(3600)).await;
                Some(())
            },
        )
        .await;
        assert!(result.is_none());
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_always_attempts_once() {
        let result = poll(Duration::ZERO, Backoff::fixed(Duration::from_secs(1)), || async {
            Some(7)
        })
        .await;
        assert_eq!(result, Some(7));
    }
}
