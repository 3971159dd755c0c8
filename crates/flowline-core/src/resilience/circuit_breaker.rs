//! Per-resource circuit breaker.
//!
//! Stops calling a failing resource for a cooldown period instead of piling
//! retries onto it. State machine:
//!
//! `CLOSED -> (failure_threshold consecutive failures) -> OPEN ->
//! (reset_timeout elapsed) -> HALF_OPEN -> (success_threshold consecutive
//! successes) -> CLOSED`
//!
//! A single failure in `HALF_OPEN` returns immediately to `OPEN` and
//! restarts the cooldown timer.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

// ---------------------------------------------------------------------------
// State and configuration
// ---------------------------------------------------------------------------

/// Observable state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls fail fast without invoking the operation.
    Open,
    /// Probation: a limited burst of calls decides between Closed and Open.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Thresholds and cooldown for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that trip the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` that close it again.
    pub success_threshold: u32,
    /// Cooldown before an `Open` circuit admits a probe call.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Hook invoked on every state transition: `(breaker_name, from, to)`.
pub type StateObserver = Box<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of an operation guarded by a circuit breaker.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E>
where
    E: std::fmt::Display,
{
    /// The circuit is open; the operation was not invoked.
    #[error("circuit '{0}' is open")]
    Open(String),

    /// The operation itself failed.
    #[error("{0}")]
    Inner(E),
}

impl<E: std::fmt::Display> CircuitBreakerError<E> {
    /// Whether this failure was a fast-fail without invoking the operation.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open(_))
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// A named circuit breaker wrapping calls to one unreliable resource.
///
/// Interior mutability via a std `Mutex`; the lock is never held across an
/// await point.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    observer: Option<StateObserver>,
}

impl CircuitBreaker {
    /// Create a breaker with the given name and thresholds.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
            observer: None,
        }
    }

    /// Attach a transition observer.
    pub fn with_observer(
        mut self,
        observer: impl Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// The breaker's name (used in logs and the `Open` error).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, moving `Open` to `HalfOpen` if the cooldown elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.admit_probe_if_cooled(&mut inner);
        inner.state
    }

    /// Execute `op` under the breaker.
    ///
    /// In `Open` state (cooldown not yet elapsed) this fails fast with
    /// `CircuitBreakerError::Open` without invoking `op`.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            self.admit_probe_if_cooled(&mut inner);
            if inner.state == CircuitState::Open {
                return Err(CircuitBreakerError::Open(self.name.clone()));
            }
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn admit_probe_if_cooled(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.reset_timeout
        {
            self.transition(inner, CircuitState::HalfOpen);
            inner.consecutive_successes = 0;
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            // A success can't be observed while Open: execute() fails fast.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::info!(
            breaker = self.name.as_str(),
            from = from.as_str(),
            to = to.as_str(),
            "circuit state changed"
        );
        if let Some(observer) = &self.observer {
            observer(&self.name, from, to);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().unwrap().state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
