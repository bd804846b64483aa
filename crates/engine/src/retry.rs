//! Bounded retry with exponential backoff.

use crate::clock::{system_clock, Clock};
use std::future::Future;
use std::sync::Arc;
use syncguard_core::error::SyncResult;
use syncguard_core::RetryConfig;

pub struct RetryPolicy {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(
            RetryConfig {
                name: name.into(),
                ..RetryConfig::default()
            },
            system_clock(),
        )
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Calls `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` calls have been made. The last error is returned.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(policy = %self.config.name, operation = operation_name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.delay_for(attempt);
                    tracing::warn!(
                        policy = %self.config.name,
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(policy = %self.config.name, operation = operation_name, attempts = attempt, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use syncguard_core::error::SyncError;

    fn policy(clock: &ManualClock) -> RetryPolicy {
        RetryPolicy::new(RetryConfig::default(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        let calls = AtomicU32::new(0);

        let result = policy(&clock)
            .execute("put", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::Remote("503".into()))
                } else {
                    Ok("stored")
                }
            })
            .await;

        assert_eq!(result, Ok("stored"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.now() - t0, Duration::from_millis(200 + 400));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let result: SyncResult<()> = policy(&clock)
            .execute("put", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Remote(format!("attempt {n}")))
            })
            .await;

        assert_eq!(result, Err(SyncError::Remote("attempt 2".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_circuit_is_not_retried() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        let calls = AtomicU32::new(0);

        let result: SyncResult<()> = policy(&clock)
            .execute("put", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::CircuitOpen {
                    name: "remote".into(),
                    retry_in_ms: 500,
                })
            })
            .await;

        assert!(matches!(result, Err(SyncError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(clock.now(), t0);
    }
}
