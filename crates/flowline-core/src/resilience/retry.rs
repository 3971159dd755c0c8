//! Generic retry-with-backoff executor for fallible async operations.
//!
//! `RetryPolicy` re-invokes an operation on failure, waiting
//! `min_timeout * factor^attempt` between attempts (optionally jittered),
//! until the operation succeeds, the attempt budget runs out, the elapsed
//! time crosses `max_retry_time`, or the error is classified non-retryable.

use std::time::Duration;

use tokio::time::Instant;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Configuration for retrying a fallible async operation.
///
/// The policy is stateless and cheap to clone; per-call state (attempt
/// counter, elapsed time) lives inside `run`/`run_with`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (3 retries = up to 4 invocations).
    max_retries: u32,
    /// Delay before the first retry.
    min_timeout: Duration,
    /// Multiplier applied per attempt.
    factor: f64,
    /// Randomize each delay in `[delay, 2 * delay)`.
    jitter: bool,
    /// Total elapsed-time budget across all attempts and waits.
    max_retry_time: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_timeout: Duration::from_secs(1),
            factor: 2.0,
            jitter: false,
            max_retry_time: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given retry count and first-retry delay.
    pub fn new(max_retries: u32, min_timeout: Duration) -> Self {
        Self {
            max_retries,
            min_timeout,
            ..Self::default()
        }
    }

    /// Set the per-attempt delay multiplier.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Randomize delays in `[delay, 2 * delay)`.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Cap the total elapsed time spent retrying.
    pub fn with_max_retry_time(mut self, budget: Duration) -> Self {
        self.max_retry_time = Some(budget);
        self
    }

    /// The deterministic delay before retry number `attempt` (0-based),
    /// before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = self.min_timeout.as_millis() as f64 * self.factor.powi(attempt as i32);
        Duration::from_millis(millis as u64)
    }

    fn sleep_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if self.jitter {
            base.mul_f64(1.0 + rand::random::<f64>())
        } else {
            base
        }
    }

    /// Run `op`, retrying every failure.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(op, |_| true, |_, _| {}).await
    }

    /// Run `op` with failure classification and a per-retry observer.
    ///
    /// On failure, `retry_if(&err)` decides whether the error class is
    /// retryable at all; a `false` rethrows immediately. Otherwise, while
    /// attempts remain and the elapsed time is inside `max_retry_time`, the
    /// policy sleeps, invokes `on_retry(&err, attempt)` (1-based retry
    /// number) and re-runs the operation. Exhaustion returns the last error.
    pub async fn run_with<T, E, F, Fut, P, H>(
        &self,
        mut op: F,
        retry_if: P,
        mut on_retry: H,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        H: FnMut(&E, u32),
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !retry_if(&err) {
                        return Err(err);
                    }
                    if attempt >= self.max_retries {
                        return Err(err);
                    }
                    let delay = self.sleep_for(attempt);
                    if let Some(budget) = self.max_retry_time
                        && started.elapsed() + delay >= budget
                    {
                        return Err(err);
                    }

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    on_retry(&err, attempt);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
