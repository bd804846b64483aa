//! Domain models, configuration, integrity checks, and error definitions.
//!
//! Foundation crate -- no async or I/O dependencies.

pub mod checksum;
pub mod error;
pub mod manifest;
pub mod types;

pub use checksum::{generate_checksum, validate_checksum, ChecksumValidator, CHECKSUM_ALGORITHM};
pub use error::{SyncError, SyncResult};
pub use manifest::{build_manifest, validate_manifest, Manifest, ManifestReport};
pub use types::{
    CircuitBreakerConfig, CircuitState, CircuitStatus, EditLock, FlushResult, LockAcquisition,
    LockRelease, MutexConfig, MutexStatus, QueueStats, ResilienceConfig, RetryConfig,
    StoredDocument, SyncQueueConfig, SyncQueueStatus, SyncReceipt,
};
