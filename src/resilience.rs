//! Retry-with-backoff and circuit breaking around broker operations.
//!
//! [`ResiliencePolicy::execute`] runs an operation through two independent
//! layers. The outer [`CircuitBreaker`] is shared by every caller holding a
//! clone of the policy, so once it trips no caller keeps hammering a dead
//! broker. The inner [`RetryPolicy`] retries transient faults with
//! exponential backoff (`base * 2^attempt`).
//!
//! Only [`Error::is_transient`] faults are retried; anything else is returned
//! on the first attempt. The breaker only counts
//! [`Error::BrokerUnreachable`] outcomes.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    base: Duration,
}

impl RetryPolicy {
    /// `attempts` counts the first try; zero is treated as one.
    pub fn new(attempts: u32, base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sleep before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cool_down: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cool_down: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cool_down,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open { until } if Instant::now() >= *until => CircuitState::HalfOpen,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Asks to run one call. Fails while open, and while a half-open trial is
    /// already running. Returns `true` when the call is the half-open trial.
    fn admit(&self, target: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *state {
            BreakerState::Closed { .. } => Ok(false),
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    tracing::info!(target, "Circuit half-open, admitting a trial call");
                    *state = BreakerState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(true)
                } else {
                    Err(Error::unreachable(target, "circuit breaker is open"))
                }
            }
            BreakerState::HalfOpen { trial_in_flight } => {
                if *trial_in_flight {
                    Err(Error::unreachable(target, "circuit breaker is half-open"))
                } else {
                    *trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// A trial that never reported back proves nothing; the next caller gets
    /// to try instead.
    fn abandon(&self, target: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let BreakerState::HalfOpen { trial_in_flight } = &mut *state {
            tracing::debug!(target, "Half-open trial dropped before finishing");
            *trial_in_flight = false;
        }
    }

    fn record<T>(&self, target: &str, outcome: &Result<T>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let tripping = matches!(outcome, Err(e) if e.is_unreachable());

        let next = match (&*state, tripping) {
            (_, false) => BreakerState::Closed { failures: 0 },
            (BreakerState::Closed { failures }, true) if failures + 1 < self.threshold => {
                BreakerState::Closed {
                    failures: failures + 1,
                }
            }
            (_, true) => {
                tracing::warn!(
                    target,
                    cool_down = ?self.cool_down,
                    "Circuit breaker opened"
                );
                BreakerState::Open {
                    until: Instant::now() + self.cool_down,
                }
            }
        };

        *state = next;
    }

    pub async fn call<T, F, Fut>(&self, target: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let trial = self.admit(target)?;
        let mut pending = Trial {
            breaker: self,
            target,
            armed: trial,
        };
        let outcome = operation().await;
        pending.armed = false;
        self.record(target, &outcome);
        outcome
    }
}

/// Held across a half-open trial so that dropping the caller's future
/// releases the trial slot.
struct Trial<'a> {
    breaker: &'a CircuitBreaker,
    target: &'a str,
    armed: bool,
}

impl Drop for Trial<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon(self.target);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(1, Duration::from_secs(60))
    }
}

/// Retry wrapped in a shared circuit breaker. Cloning shares the breaker and
/// the retry counters.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    retries: Arc<papaya::HashMap<String, u64>>,
}

impl ResiliencePolicy {
    pub fn new(retry: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self {
            retry,
            breaker: Arc::new(breaker),
            retries: Arc::new(papaya::HashMap::new()),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Total retries issued against `target` since this policy was created.
    pub fn retries_for(&self, target: &str) -> u64 {
        self.retries.pin().get(target).copied().unwrap_or(0)
    }

    fn count_retry(&self, target: &str) {
        self.retries
            .pin()
            .update_or_insert(target.to_owned(), |count| count + 1, 1);
    }

    pub async fn execute<T, F, Fut>(&self, target: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker
            .call(target, || self.retry(target, operation))
            .await
    }

    async fn retry<T, F, Fut>(&self, target: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt + 1 >= self.retry.attempts() => {
                    tracing::error!(target, attempts = attempt + 1, "Giving up: {e}");
                    return Err(if e.is_unreachable() {
                        e
                    } else {
                        e.into_channel_failure()
                    });
                }
                Err(e) => {
                    let wait = self.retry.backoff(attempt);
                    tracing::warn!(target, attempt, ?wait, "Retrying after transient fault: {e}");
                    self.count_retry(target);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), CircuitBreaker::default())
    }
}
