//! Circuit breaker for remote calls.
//!
//! # States
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls fail fast with `CircuitOpen` until the open timeout expires
//! - HalfOpen: exactly one trial call is let through
//!
//! ```text
//! Closed   -> Open:     failure_count >= failure_threshold
//! Open     -> HalfOpen: first call after next_attempt
//! HalfOpen -> Closed:   trial succeeds
//! HalfOpen -> Open:     trial fails (deadline re-armed)
//! ```
//!
//! The breaker never retries and never swallows errors: the wrapped
//! operation's own error is returned after bookkeeping.

use crate::clock::{system_clock, Clock};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use syncguard_core::error::SyncError;
use syncguard_core::{CircuitBreakerConfig, CircuitState, CircuitStatus};

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    total_requests: u64,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            last_failure: None,
            next_attempt: None,
            trial_in_flight: false,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::named(name), system_clock())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn inner(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.inner().state
    }

    /// Runs `operation` unless the circuit is open.
    ///
    /// Fails fast with [`SyncError::CircuitOpen`] (converted into `E`)
    /// without invoking `operation` while open, or while a half-open trial is
    /// already in flight.
    pub async fn execute<T, E, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SyncError> + Display,
    {
        let is_trial = self.admit(operation_name)?;
        let mut trial = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let result = operation().await;
        trial.armed = false;

        match &result {
            Ok(_) => self.on_success(operation_name),
            Err(e) => self.on_failure(operation_name, e),
        }
        result
    }

    /// Counts the request and decides whether it may run. `Ok(true)` marks
    /// the half-open trial call.
    fn admit(&self, operation_name: &str) -> Result<bool, SyncError> {
        let mut s = self.inner();
        s.total_requests += 1;

        match s.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let now = self.clock.now();
                match s.next_attempt {
                    Some(at) if now < at => {
                        let retry_in_ms = at.saturating_duration_since(now).as_millis() as u64;
                        tracing::debug!(
                            name = %self.config.name,
                            operation = operation_name,
                            retry_in_ms,
                            "circuit open, failing fast"
                        );
                        Err(self.open_error(retry_in_ms))
                    }
                    _ => {
                        s.state = CircuitState::HalfOpen;
                        s.trial_in_flight = true;
                        tracing::info!(
                            name = %self.config.name,
                            operation = operation_name,
                            "circuit half-open, allowing trial call"
                        );
                        Ok(true)
                    }
                }
            }
            // HalfOpen always has its single trial in flight.
            CircuitState::HalfOpen => {
                tracing::debug!(
                    name = %self.config.name,
                    operation = operation_name,
                    "trial in flight, failing fast"
                );
                Err(self.open_error(0))
            }
        }
    }

    fn open_error(&self, retry_in_ms: u64) -> SyncError {
        SyncError::CircuitOpen {
            name: self.config.name.clone(),
            retry_in_ms,
        }
    }

    fn on_success(&self, operation_name: &str) {
        let mut s = self.inner();
        s.success_count += 1;

        match s.state {
            CircuitState::HalfOpen => {
                s.state = CircuitState::Closed;
                s.failure_count = 0;
                s.next_attempt = None;
                s.trial_in_flight = false;
                tracing::info!(name = %self.config.name, operation = operation_name, "circuit closed");
            }
            CircuitState::Closed => s.failure_count = 0,
            // Late result of a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, operation_name: &str, error: &dyn Display) {
        let mut s = self.inner();
        let now = self.clock.now();
        s.failure_count += 1;
        s.last_failure = Some(now);

        match s.state {
            CircuitState::HalfOpen => {
                s.state = CircuitState::Open;
                s.next_attempt = Some(now + self.config.open_timeout());
                s.trial_in_flight = false;
                tracing::warn!(
                    name = %self.config.name,
                    operation = operation_name,
                    error = %error,
                    open_timeout_ms = self.config.open_timeout_ms,
                    "trial call failed, circuit reopened"
                );
            }
            CircuitState::Closed if s.failure_count >= self.config.failure_threshold => {
                s.state = CircuitState::Open;
                s.next_attempt = Some(now + self.config.open_timeout());
                tracing::warn!(
                    name = %self.config.name,
                    operation = operation_name,
                    error = %error,
                    failures = s.failure_count,
                    open_timeout_ms = self.config.open_timeout_ms,
                    "circuit opened"
                );
            }
            CircuitState::Closed => {
                tracing::debug!(
                    name = %self.config.name,
                    operation = operation_name,
                    error = %error,
                    failures = s.failure_count,
                    threshold = self.config.failure_threshold,
                    "call failed"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the circuit closed. Admin/debug override.
    pub fn reset(&self) {
        let mut s = self.inner();
        s.state = CircuitState::Closed;
        s.failure_count = 0;
        s.next_attempt = None;
        s.trial_in_flight = false;
        tracing::info!(name = %self.config.name, "circuit manually reset");
    }

    pub fn status(&self) -> CircuitStatus {
        let s = self.inner();
        let now = self.clock.now();
        CircuitStatus {
            name: self.config.name.clone(),
            state: s.state,
            failure_count: s.failure_count,
            success_count: s.success_count,
            total_requests: s.total_requests,
            failure_threshold: self.config.failure_threshold,
            last_failure_ago_ms: s
                .last_failure
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            next_attempt_in_ms: s
                .next_attempt
                .map(|t| t.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// Reopens the circuit with an immediate deadline if a trial call is
/// dropped before reporting, so the next caller can run a trial.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut s = self.breaker.inner();
        if s.state == CircuitState::HalfOpen && s.trial_in_flight {
            s.state = CircuitState::Open;
            s.trial_in_flight = false;
            s.next_attempt = Some(self.breaker.clock.now());
            tracing::debug!(name = %self.breaker.config.name, "trial call abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig {
                name: "ChunkedSyncCircuit".into(),
                failure_threshold: 3,
                open_timeout_ms: 1_000,
            },
            Arc::new(clock.clone()),
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), SyncError> {
        cb.execute("put", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Remote("503".into()))
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicUsize) -> Result<u32, SyncError> {
        cb.execute("put", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await
    }

    async fn trip(cb: &CircuitBreaker, calls: &AtomicUsize) {
        for _ in 0..3 {
            assert_eq!(fail(cb, calls).await, Err(SyncError::Remote("503".into())));
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn opens_at_threshold_and_fails_fast() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicUsize::new(0);

        trip(&cb, &calls).await;

        let err = succeed(&cb, &calls).await.unwrap_err();
        assert!(matches!(err, SyncError::CircuitOpen { retry_in_ms: 1_000, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let status = cb.status();
        assert_eq!(status.total_requests, 4);
        assert_eq!(status.failure_count, 3);
        assert_eq!(status.next_attempt_in_ms, Some(1_000));
    }

    #[tokio::test]
    async fn half_open_success_closes() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicUsize::new(0);
        trip(&cb, &calls).await;

        clock.advance(Duration::from_millis(1_000));
        assert_eq!(succeed(&cb, &calls).await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.next_attempt_in_ms, None);
    }

    #[tokio::test]
    async fn half_open_failure_rearms() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicUsize::new(0);
        trip(&cb, &calls).await;

        clock.advance(Duration::from_millis(1_500));
        assert!(matches!(fail(&cb, &calls).await, Err(SyncError::Remote(_))));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.status().next_attempt_in_ms, Some(1_000));

        assert!(matches!(
            succeed(&cb, &calls).await,
            Err(SyncError::CircuitOpen { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicUsize::new(0);

        fail(&cb, &calls).await.unwrap_err();
        fail(&cb, &calls).await.unwrap_err();
        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.status().failure_count, 0);

        fail(&cb, &calls).await.unwrap_err();
        fail(&cb, &calls).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn only_one_trial_at_a_time() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicUsize::new(0);
        trip(&cb, &calls).await;
        clock.advance(Duration::from_millis(1_000));

        let (release_trial, hold) = tokio::sync::oneshot::channel::<()>();
        let trial = cb.execute("trial", move || async move {
            let _ = hold.await;
            Ok::<_, SyncError>("recovered")
        });
        let second = async {
            let r = succeed(&cb, &calls).await;
            let _ = release_trial.send(());
            r
        };

        let (trial, second) = tokio::join!(trial, second);
        assert_eq!(trial, Ok("recovered"));
        assert!(matches!(second, Err(SyncError::CircuitOpen { retry_in_ms: 0, .. })));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn abandoned_trial_reopens_for_next_trial() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicUsize::new(0);
        trip(&cb, &calls).await;
        clock.advance(Duration::from_millis(1_000));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            cb.execute("hang", || std::future::pending::<Result<(), SyncError>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        assert_eq!(succeed(&cb, &calls).await, Ok(7));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicUsize::new(0);
        trip(&cb, &calls).await;

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb, &calls).await, Ok(7));
    }
}
