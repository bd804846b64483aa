//! Collaborator abstractions consumed by the sync engine.
//!
//! The engine never speaks a wire protocol itself: it writes opaque
//! [`StoredDocument`]s through a [`RemoteStore`] and consults an
//! [`EditLockProvider`] before touching records it may not own.

pub mod locks;
pub mod memory;

use async_trait::async_trait;
use syncguard_core::error::SyncResult;
use syncguard_core::{EditLock, LockAcquisition, LockRelease, StoredDocument};

pub use locks::{LockSubscription, MemoryEditLocks};
pub use memory::MemoryStore;

/// Abstraction for the remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn put(&self, key: &str, document: StoredDocument) -> SyncResult<()>;
    async fn get(&self, key: &str) -> SyncResult<Option<StoredDocument>>;
}

/// Callback invoked with the current lock state (`None` once released).
pub type LockCallback = Box<dyn Fn(Option<&EditLock>) + Send + Sync>;

/// Advisory cross-client edit locks.
#[async_trait]
pub trait EditLockProvider: Send + Sync {
    async fn acquire(&self, record_type: &str, record_id: &str) -> SyncResult<LockAcquisition>;
    async fn release(&self, record_type: &str, record_id: &str) -> SyncResult<LockRelease>;

    /// Reads the current lock without taking it.
    async fn inspect(&self, record_type: &str, record_id: &str) -> SyncResult<Option<EditLock>>;

    /// Subscribes to lock changes for one record. Dropping the returned
    /// subscription (or calling `unsubscribe`) stops notifications.
    fn watch(&self, record_type: &str, record_id: &str, callback: LockCallback) -> LockSubscription;
}
