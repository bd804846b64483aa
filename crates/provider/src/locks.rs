//! In-process edit-lock service.
//!
//! Several [`MemoryEditLocks`] handles created through
//! [`MemoryEditLocks::for_user`] share one lock table, which models two tabs
//! or devices contending for the same record.

use crate::{EditLockProvider, LockCallback};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use syncguard_core::error::SyncResult;
use syncguard_core::types::unix_millis;
use syncguard_core::{EditLock, LockAcquisition, LockRelease};

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

type RecordKey = (String, String);
type SharedCallback = Arc<dyn Fn(Option<&EditLock>) + Send + Sync>;

#[derive(Default)]
struct LockTable {
    locks: HashMap<RecordKey, EditLock>,
    watchers: HashMap<RecordKey, Vec<(u64, SharedCallback)>>,
    next_watcher_id: u64,
}

/// Handle returned by [`EditLockProvider::watch`]. Unsubscribes on drop.
pub struct LockSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl LockSubscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for LockSubscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

/// Edit locks for one user over a (possibly shared) lock table.
#[derive(Clone)]
pub struct MemoryEditLocks {
    table: Arc<Mutex<LockTable>>,
    user_id: String,
    user_name: String,
    ttl: Duration,
}

impl MemoryEditLocks {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            table: Arc::new(Mutex::new(LockTable::default())),
            user_id: user_id.into(),
            user_name: user_name.into(),
            ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Another user's handle over the same lock table.
    pub fn for_user(&self, user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            table: Arc::clone(&self.table),
            user_id: user_id.into(),
            user_name: user_name.into(),
            ttl: self.ttl,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Invokes watchers outside the table lock so callbacks may re-enter.
    fn notify(&self, key: &RecordKey, lock: Option<&EditLock>) {
        let callbacks: Vec<SharedCallback> = self
            .table()
            .watchers
            .get(key)
            .map(|ws| ws.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for cb in callbacks {
            cb(lock);
        }
    }
}

fn record_key(record_type: &str, record_id: &str) -> RecordKey {
    (record_type.to_string(), record_id.to_string())
}

#[async_trait]
impl EditLockProvider for MemoryEditLocks {
    async fn acquire(&self, record_type: &str, record_id: &str) -> SyncResult<LockAcquisition> {
        let key = record_key(record_type, record_id);
        let now = unix_millis();

        let granted = {
            let mut table = self.table();
            if let Some(existing) = table.locks.get(&key) {
                if existing.blocks(&self.user_id, now) {
                    tracing::debug!(
                        record = %existing.record(),
                        locked_by = %existing.user_name,
                        "edit lock denied"
                    );
                    return Ok(LockAcquisition {
                        success: false,
                        reason: Some(format!("Record is being edited by {}", existing.user_name)),
                        expires_at_ms: Some(existing.expires_at_ms),
                        locked_by: Some(existing.user_name.clone()),
                    });
                }
            }

            let lock = EditLock {
                record_type: record_type.to_string(),
                record_id: record_id.to_string(),
                user_id: self.user_id.clone(),
                user_name: self.user_name.clone(),
                expires_at_ms: now + self.ttl.as_millis() as u64,
            };
            table.locks.insert(key.clone(), lock.clone());
            lock
        };

        tracing::debug!(record = %granted.record(), user = %self.user_id, "edit lock acquired");
        self.notify(&key, Some(&granted));

        Ok(LockAcquisition {
            success: true,
            reason: None,
            expires_at_ms: Some(granted.expires_at_ms),
            locked_by: Some(granted.user_name),
        })
    }

    async fn release(&self, record_type: &str, record_id: &str) -> SyncResult<LockRelease> {
        let key = record_key(record_type, record_id);
        let released = {
            let mut table = self.table();
            match table.locks.get(&key) {
                Some(lock) if lock.is_owned_by(&self.user_id) => {
                    table.locks.remove(&key);
                    true
                }
                _ => false,
            }
        };

        if released {
            tracing::debug!(record_type, record_id, "edit lock released");
            self.notify(&key, None);
        }
        Ok(LockRelease { success: released })
    }

    async fn inspect(&self, record_type: &str, record_id: &str) -> SyncResult<Option<EditLock>> {
        Ok(self
            .table()
            .locks
            .get(&record_key(record_type, record_id))
            .cloned())
    }

    fn watch(&self, record_type: &str, record_id: &str, callback: LockCallback) -> LockSubscription {
        let key = record_key(record_type, record_id);
        let callback: SharedCallback = Arc::from(callback);

        let (id, current) = {
            let mut table = self.table();
            let id = table.next_watcher_id;
            table.next_watcher_id += 1;
            table
                .watchers
                .entry(key.clone())
                .or_default()
                .push((id, Arc::clone(&callback)));
            (id, table.locks.get(&key).cloned())
        };
        callback(current.as_ref());

        let table = Arc::downgrade(&self.table);
        LockSubscription::new(move || {
            if let Some(table) = table.upgrade() {
                let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(ws) = table.watchers.get_mut(&key) {
                    ws.retain(|(wid, _)| *wid != id);
                    if ws.is_empty() {
                        table.watchers.remove(&key);
                    }
                }
            }
        })
    }
}
