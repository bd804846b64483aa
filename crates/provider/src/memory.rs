//! In-process remote store with fault injection.
//!
//! Backs the integration tests and the CLI simulator. Failures and
//! corruption are injected explicitly so outage scenarios are reproducible.

use crate::RemoteStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use syncguard_core::error::{SyncError, SyncResult};
use syncguard_core::StoredDocument;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
    fail_puts: AtomicU32,
    fail_gets: AtomicU32,
    latency_ms: AtomicU64,
    put_calls: AtomicU64,
    get_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` puts fail with a remote error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// The next `n` gets fail with a remote error.
    pub fn fail_next_gets(&self, n: u32) {
        self.fail_gets.store(n, Ordering::SeqCst);
    }

    /// Simulated round-trip time applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Flips the body of a stored document without touching its checksum.
    /// Returns `false` if the key is absent.
    pub async fn corrupt(&self, key: &str) -> bool {
        let mut docs = self.documents.write().await;
        match docs.get_mut(key) {
            Some(doc) => {
                doc.body.push('~');
                tracing::debug!(key, "corrupted stored document");
                true
            }
            None => false,
        }
    }

    /// Raw write that bypasses fault injection, for seeding fixtures.
    pub async fn insert_raw(&self, key: &str, document: StoredDocument) {
        self.documents.write().await.insert(key.to_string(), document);
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.documents.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Consumes one injected failure, if any are armed.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn put(&self, key: &str, document: StoredDocument) -> SyncResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if take_failure(&self.fail_puts) {
            tracing::debug!(key, "injected put failure");
            return Err(SyncError::Remote(format!("injected failure writing {key}")));
        }

        tracing::trace!(key, bytes = document.body.len(), "put");
        self.documents.write().await.insert(key.to_string(), document);
        Ok(())
    }

    async fn get(&self, key: &str) -> SyncResult<Option<StoredDocument>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if take_failure(&self.fail_gets) {
            tracing::debug!(key, "injected get failure");
            return Err(SyncError::Remote(format!("injected failure reading {key}")));
        }

        Ok(self.documents.read().await.get(key).cloned())
    }
}
