//! Rate limiting and retry for outbound calls.
//!
//! Two independent limiter instances are configured at process startup: a
//! conservative one for the flow platform and a looser one for the payment
//! gateway. The executor itself is stateless apart from the limiter's
//! call-history window.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::UpstreamError;

/// Token-bucket limiter over a rolling window.
///
/// `acquire()` blocks until a slot frees up. The window is recomputed from
/// the recorded call instants on every acquisition rather than on fixed
/// ticks, so a burst never observes more than `max_calls` in any window.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Conservative default for the flow platform: 12 calls per minute.
    pub fn upstream_default() -> Self {
        Self::new(12, Duration::from_secs(60))
    }

    /// Looser default for the payment gateway: 30 calls per minute.
    pub fn payment_default() -> Self {
        Self::new(30, Duration::from_secs(60))
    }

    /// Acquire permission for one call, waiting as long as necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();

                while let Some(front) = calls.front() {
                    if now.duration_since(*front) >= self.window {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }

                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }

                // Oldest call leaves the window first; wait for that slot.
                let oldest = *calls.front().expect("non-empty at capacity");
                self.window - now.duration_since(oldest)
            };

            warn!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Exponential backoff schedule: attempt `i` waits `min(base * factor^i, cap)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_retries: u32,
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            factor: 2.0,
            cap,
        }
    }

    /// Delay before retrying after failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt as i32);
        let delay = self.base.mul_f64(exp);
        delay.min(self.cap)
    }
}

/// Wraps every outbound call with the limiter and the retry schedule.
#[derive(Debug)]
pub struct RequestExecutor {
    limiter: RateLimiter,
    backoff: Backoff,
}

impl RequestExecutor {
    pub fn new(limiter: RateLimiter, backoff: Backoff) -> Self {
        Self { limiter, backoff }
    }

    /// Execute `op`, retrying transport errors, 5xx and 429 responses with
    /// exponential backoff. A 429 carrying `Retry-After` honors the server's
    /// value instead of the computed delay. Exhausting the retries re-raises
    /// the last failure.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;

            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retriable() && attempt < self.backoff.max_retries => {
                    let delay = match e.retry_after() {
                        Some(secs) => Duration::from_secs(secs),
                        None => self.backoff.delay_for_attempt(attempt),
                    };
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.backoff.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "request failed, retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn limiter_delays_calls_beyond_the_window() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        let start = Instant::now();
        let mut acquired_at = Vec::new();

        for _ in 0..15 {
            limiter.acquire().await;
            acquired_at.push(Instant::now());
        }

        // First ten pass immediately, the rest wait for their window slot.
        for t in &acquired_at[..10] {
            assert_eq!(t.duration_since(start), Duration::ZERO);
        }
        for t in &acquired_at[10..] {
            assert!(t.duration_since(start) >= Duration::from_secs(60));
        }

        // No rolling window ever observes more than ten calls.
        for (i, t) in acquired_at.iter().enumerate() {
            let in_window = acquired_at
                .iter()
                .skip(i)
                .take_while(|u| u.duration_since(*t) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 10, "window starting at call {} holds {}", i, in_window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_admits_again_once_a_slot_frees() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(10));
    }

    #[test]
    fn backoff_grows_until_the_cap() {
        let backoff = Backoff::new(5, Duration::from_secs(2), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_op_is_retried_then_raises_the_last_error() {
        let executor = RequestExecutor::new(
            RateLimiter::new(100, Duration::from_secs(60)),
            Backoff::new(3, Duration::from_secs(1), Duration::from_secs(60)),
        );

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let start = Instant::now();

        let result: Result<(), _> = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::Status {
                        status: 500,
                        body: "boom".to_string(),
                        retry_after: None,
                    })
                }
            })
            .await;

        // One initial attempt plus max_retries retries, delays 1s + 2s + 4s.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(7));
        match result {
            Err(UpstreamError::Status { status: 500, .. }) => {}
            other => panic!("expected the original 500 to surface, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_the_computed_delay() {
        let executor = RequestExecutor::new(
            RateLimiter::new(100, Duration::from_secs(60)),
            Backoff::new(1, Duration::from_secs(1), Duration::from_secs(60)),
        );

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let start = Instant::now();

        let result = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(UpstreamError::Status {
                            status: 429,
                            body: String::new(),
                            retry_after: Some(30),
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn non_retriable_errors_surface_immediately() {
        let executor = RequestExecutor::new(
            RateLimiter::new(100, Duration::from_secs(60)),
            Backoff::default(),
        );

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::LaunchRejected("bad input".to_string()))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(UpstreamError::LaunchRejected(_))));
    }
}
