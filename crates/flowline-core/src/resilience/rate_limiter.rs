//! Sliding-window rate limiter with wait/backpressure.
//!
//! Admits at most `max_requests` calls per `window`, tracked as a sliding
//! window of admission timestamps. Callers can either fail fast when the
//! window is full or park until capacity frees (bounded by a wait budget).
//! `pause`/`resume` provide manual backpressure independent of the window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

/// Window bounds for a rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum admissions per window.
    pub max_requests: usize,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(1),
        }
    }
}

/// Failure to admit a call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// The window is full (or the limiter is paused) and the caller chose
    /// not to wait.
    #[error("rate limit exceeded")]
    Exhausted,

    /// The caller waited but capacity did not free within the wait budget.
    #[error("timed out waiting for rate limit capacity")]
    WaitTimeout,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

struct LimiterInner {
    admitted: VecDeque<Instant>,
    paused: bool,
}

/// Sliding-window admission control.
pub struct RateLimiter {
    config: RateLimiterConfig,
    inner: Mutex<LimiterInner>,
    /// Signalled on `resume` so parked callers re-check immediately.
    freed: Notify,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Mutex::new(LimiterInner {
                admitted: VecDeque::with_capacity(config.max_requests),
                paused: false,
            }),
            config,
            freed: Notify::new(),
        }
    }

    /// Stop admitting calls until `resume` regardless of window capacity.
    pub fn pause(&self) {
        self.inner.lock().expect("limiter lock poisoned").paused = true;
        tracing::debug!("rate limiter paused");
    }

    /// Lift a pause and wake parked callers.
    pub fn resume(&self) {
        self.inner.lock().expect("limiter lock poisoned").paused = false;
        self.freed.notify_waiters();
        tracing::debug!("rate limiter resumed");
    }

    /// Admissions currently inside the window.
    pub fn in_flight(&self) -> usize {
        let mut inner = self.inner.lock().expect("limiter lock poisoned");
        Self::slide(&mut inner, Instant::now(), self.config.window);
        inner.admitted.len()
    }

    /// Drop admissions that have left the window.
    fn slide(inner: &mut LimiterInner, now: Instant, window: Duration) {
        while inner
            .admitted
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            inner.admitted.pop_front();
        }
    }

    /// Try to take one admission slot.
    ///
    /// Returns `Ok(())` immediately when capacity is available. Otherwise:
    /// `wait = false` fails with `Exhausted`; `wait = true` parks until the
    /// window slides or `resume` fires, bounded by `max_wait` (`None` =
    /// unbounded).
    pub async fn acquire(
        &self,
        wait: bool,
        max_wait: Option<Duration>,
    ) -> Result<(), RateLimitError> {
        let deadline = max_wait.map(|d| Instant::now() + d);

        loop {
            // Probe under the lock; never hold it across an await.
            let retry_at = {
                let mut inner = self.inner.lock().expect("limiter lock poisoned");
                let now = Instant::now();
                Self::slide(&mut inner, now, self.config.window);

                if !inner.paused && inner.admitted.len() < self.config.max_requests {
                    inner.admitted.push_back(now);
                    return Ok(());
                }

                if inner.paused {
                    // Only resume() can free us.
                    None
                } else {
                    // Capacity frees when the oldest admission leaves the window.
                    inner.admitted.front().map(|t| *t + self.config.window)
                }
            };

            if !wait {
                return Err(RateLimitError::Exhausted);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(RateLimitError::WaitTimeout);
            }

            let sleep_until = match (retry_at, deadline) {
                (Some(retry), Some(deadline)) => Some(retry.min(deadline)),
                (Some(retry), None) => Some(retry),
                (None, Some(deadline)) => Some(deadline),
                (None, None) => None,
            };

            match sleep_until {
                Some(until) => {
                    tokio::select! {
                        _ = self.freed.notified() => {}
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                None => self.freed.notified().await,
            }
        }
    }

    /// Admit and run `op` under the limiter.
    pub async fn execute<T, F, Fut>(
        &self,
        op: F,
        wait: bool,
        max_wait: Option<Duration>,
    ) -> Result<T, RateLimitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(wait, max_wait).await?;
        Ok(op().await)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.config.max_requests)
            .field("window", &self.config.window)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
