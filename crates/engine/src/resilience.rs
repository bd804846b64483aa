//! Composition of the reliability primitives for one remote endpoint, and a
//! registry that shares mutexes and breakers by name.

use crate::circuit::CircuitBreaker;
use crate::clock::Clock;
use crate::mutex::SyncMutex;
use crate::queue::SyncQueue;
use crate::retry::RetryPolicy;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use syncguard_core::error::SyncResult;
use syncguard_core::{
    CircuitBreakerConfig, CircuitStatus, MutexConfig, MutexStatus, ResilienceConfig,
    SyncQueueConfig,
};

/// Retry around circuit breaker, plus the queue settings for the endpoint.
pub struct SyncResilience {
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    queue_config: SyncQueueConfig,
    clock: Arc<dyn Clock>,
}

impl SyncResilience {
    pub fn new(
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        queue_config: SyncQueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            retry,
            breaker,
            queue_config,
            clock,
        }
    }

    /// Bundle with a breaker of its own.
    pub fn from_config(config: &ResilienceConfig, clock: Arc<dyn Clock>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            Arc::clone(&clock),
        ));
        Self::new(
            RetryPolicy::new(config.retry.clone(), Arc::clone(&clock)),
            breaker,
            config.sync_queue.clone(),
            clock,
        )
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs `operation` through the breaker, retrying retryable failures.
    ///
    /// Each attempt's future is created up front but only polled if the
    /// breaker admits the call. An open circuit ends the retry loop.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let breaker = &self.breaker;
        self.retry
            .execute(operation_name, || {
                let attempt = operation();
                breaker.execute(operation_name, move || attempt)
            })
            .await
    }

    /// New queue with this bundle's queue settings.
    pub fn new_queue<P, R>(&self) -> SyncQueue<P, R>
    where
        P: Send + 'static,
        R: Send + 'static,
    {
        SyncQueue::new(self.queue_config.clone(), Arc::clone(&self.clock))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub mutexes: Vec<MutexStatus>,
    pub circuit_breakers: Vec<CircuitStatus>,
}

/// One shared [`SyncMutex`] / [`CircuitBreaker`] per name.
///
/// The first configuration registered under a name wins; later lookups with
/// a different configuration get the existing instance.
pub struct ResilienceRegistry {
    clock: Arc<dyn Clock>,
    mutexes: Mutex<HashMap<String, Arc<SyncMutex>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl ResilienceRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            mutexes: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn mutex(&self, config: MutexConfig) -> Arc<SyncMutex> {
        let mut mutexes = self.mutexes.lock().unwrap_or_else(PoisonError::into_inner);
        let clock = &self.clock;
        Arc::clone(mutexes.entry(config.name.clone()).or_insert_with(|| {
            tracing::debug!(name = %config.name, "registered mutex");
            Arc::new(SyncMutex::new(config, Arc::clone(clock)))
        }))
    }

    pub fn breaker(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let clock = &self.clock;
        Arc::clone(breakers.entry(config.name.clone()).or_insert_with(|| {
            tracing::debug!(name = %config.name, "registered circuit breaker");
            Arc::new(CircuitBreaker::new(config, Arc::clone(clock)))
        }))
    }

    /// Bundle whose breaker is shared through this registry.
    pub fn resilience(&self, config: &ResilienceConfig) -> SyncResilience {
        SyncResilience::new(
            RetryPolicy::new(config.retry.clone(), Arc::clone(&self.clock)),
            self.breaker(config.circuit_breaker.clone()),
            config.sync_queue.clone(),
            Arc::clone(&self.clock),
        )
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn status(&self) -> RegistryStatus {
        let mut mutexes: Vec<MutexStatus> = self
            .mutexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|m| m.status())
            .collect();
        mutexes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut circuit_breakers: Vec<CircuitStatus> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|b| b.status())
            .collect();
        circuit_breakers.sort_by(|a, b| a.name.cmp(&b.name));

        RegistryStatus {
            mutexes,
            circuit_breakers,
        }
    }
}
