//! Named async mutex with FIFO hand-off.
//!
//! Serializes a critical section across tasks of one process. Waiters are
//! served strictly in arrival order, and `release` hands the lock straight to
//! the next waiter so no other caller can slip in between.
//!
//! Ownership is decided by the `holder` id under the state lock, never by
//! whether a wake-up message was delivered. A waiter that times out or is
//! dropped after being handed the lock therefore either keeps it (timeout) or
//! passes it on (drop).

use crate::clock::{system_clock, Clock};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use syncguard_core::error::{SyncError, SyncResult};
use syncguard_core::{MutexConfig, MutexStatus};
use tokio::sync::oneshot;

struct Waiter {
    id: u64,
    operation_name: String,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct MutexState {
    locked: bool,
    holder: Option<u64>,
    current_operation: Option<String>,
    lock_start: Option<Instant>,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

pub struct SyncMutex {
    config: MutexConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<MutexState>,
}

impl SyncMutex {
    pub fn new(config: MutexConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(MutexState::default()),
        }
    }

    /// Mutex with default timeout on the system clock.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(MutexConfig::named(name), system_clock())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn state(&self) -> MutexGuard<'_, MutexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grant(&self, state: &mut MutexState, id: u64, operation_name: &str) {
        state.locked = true;
        state.holder = Some(id);
        state.current_operation = Some(operation_name.to_string());
        state.lock_start = Some(self.clock.now());
    }

    /// Waits up to `timeout` for the lock.
    ///
    /// Prefer [`execute`](Self::execute): a bare `acquire` must be paired with
    /// exactly one [`release`](Self::release) on every exit path.
    pub async fn acquire(&self, operation_name: &str, timeout: Duration) -> SyncResult<()> {
        let (id, wake) = {
            let mut state = self.state();
            let id = state.next_id;
            state.next_id += 1;

            if !state.locked {
                self.grant(&mut state, id, operation_name);
                tracing::debug!(name = %self.config.name, operation = operation_name, "lock acquired");
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                id,
                operation_name: operation_name.to_string(),
                wake: tx,
            });
            tracing::debug!(
                name = %self.config.name,
                operation = operation_name,
                current = ?state.current_operation,
                queue_length = state.queue.len(),
                "waiting for lock"
            );
            (id, rx)
        };

        let mut pending = PendingWaiter {
            mutex: self,
            id,
            armed: true,
        };
        tokio::select! {
            _ = wake => {}
            _ = self.clock.sleep(timeout) => {}
        }
        pending.armed = false;

        let mut state = self.state();
        if state.holder == Some(id) {
            tracing::debug!(name = %self.config.name, operation = operation_name, "lock acquired after wait");
            return Ok(());
        }

        state.queue.retain(|w| w.id != id);
        tracing::warn!(
            name = %self.config.name,
            operation = operation_name,
            timeout_ms = timeout.as_millis() as u64,
            holder = ?state.current_operation,
            "lock wait timed out"
        );
        Err(SyncError::MutexTimeout {
            name: self.config.name.clone(),
            operation: operation_name.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    /// Releases the lock, handing it to the earliest waiter if any.
    ///
    /// Releasing an unlocked mutex is logged and ignored.
    pub fn release(&self) {
        let mut state = self.state();
        if !state.locked {
            tracing::warn!(name = %self.config.name, "release called on unlocked mutex");
            return;
        }
        self.release_locked(&mut state);
    }

    fn release_locked(&self, state: &mut MutexState) {
        let held_ms = state
            .lock_start
            .map(|t| self.clock.now().saturating_duration_since(t).as_millis() as u64)
            .unwrap_or(0);
        let finished = state.current_operation.take();

        match state.queue.pop_front() {
            Some(next) => {
                self.grant(state, next.id, &next.operation_name);
                tracing::debug!(
                    name = %self.config.name,
                    from = ?finished,
                    to = %next.operation_name,
                    held_ms,
                    remaining = state.queue.len(),
                    "lock handed off"
                );
                // A dropped receiver is handled by the waiter's own cleanup.
                let _ = next.wake.send(());
            }
            None => {
                state.locked = false;
                state.holder = None;
                state.lock_start = None;
                tracing::debug!(name = %self.config.name, operation = ?finished, held_ms, "lock released");
            }
        }
    }

    /// Runs `f` while holding the lock, releasing it on every exit path:
    /// success, error, panic, or the caller dropping this future.
    pub async fn execute<T, E, F, Fut>(&self, operation_name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SyncError>,
    {
        self.acquire(operation_name, self.config.timeout()).await?;
        let _held = HeldLock { mutex: self };
        f().await
    }

    /// Read-only snapshot for diagnostics.
    pub fn status(&self) -> MutexStatus {
        let state = self.state();
        MutexStatus {
            name: self.config.name.clone(),
            locked: state.locked,
            current_operation: state.current_operation.clone(),
            queue_length: state.queue.len(),
            lock_duration_ms: state
                .lock_start
                .map(|t| self.clock.now().saturating_duration_since(t).as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

/// Releases on drop.
struct HeldLock<'a> {
    mutex: &'a SyncMutex,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

/// Cleans up a waiter whose `acquire` future was dropped mid-wait.
struct PendingWaiter<'a> {
    mutex: &'a SyncMutex,
    id: u64,
    armed: bool,
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.mutex.state();
        if let Some(pos) = state.queue.iter().position(|w| w.id == self.id) {
            state.queue.remove(pos);
            tracing::debug!(name = %self.mutex.config.name, "abandoned lock wait");
        } else if state.holder == Some(self.id) {
            self.mutex.release_locked(&mut state);
        }
    }
}
