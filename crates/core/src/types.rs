//! Domain types for the syncguard reliability engine.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Guards user-visible operations, so the default wait is generous.
pub const DEFAULT_MUTEX_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_DEBOUNCE_MS: u64 = 1_000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutexConfig {
    /// Critical-section name. Must encode context (e.g. budget id) when
    /// several independent contexts share a process.
    pub name: String,
    pub timeout_ms: u64,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            name: "SyncMutex".into(),
            timeout_ms: DEFAULT_MUTEX_TIMEOUT_MS,
        }
    }
}

impl MutexConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Consecutive failures in `Closed` that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call.
    pub open_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "CircuitBreaker".into(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_timeout_ms: DEFAULT_OPEN_TIMEOUT_MS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncQueueConfig {
    pub name: String,
    pub debounce_ms: u64,
    /// Pending-key count that triggers an early background flush.
    pub max_batch_size: usize,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            name: "SyncQueue".into(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl SyncQueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub name: String,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            name: "RetryPolicy".into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryConfig {
    /// Backoff before `attempt` (1-based retry index): `base * 2^(attempt-1)`,
    /// capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let ms = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Everything one remote endpoint needs, loadable from a single JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub mutex: MutexConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub sync_queue: SyncQueueConfig,
}

// ---------------------------------------------------------------------------
// Status snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutexStatus {
    pub name: String,
    pub locked: bool,
    pub current_operation: Option<String>,
    pub queue_length: usize,
    pub lock_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub total_requests: u64,
    pub failure_threshold: u32,
    /// Time since the last recorded failure.
    pub last_failure_ago_ms: Option<u64>,
    /// Remaining open time; zero once a trial call is allowed.
    pub next_attempt_in_ms: Option<u64>,
}

/// Cumulative queue counters. Never reset by `clear()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub superseded: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncQueueStatus {
    pub name: String,
    pub pending: usize,
    pub processing: usize,
    pub stats: QueueStats,
}

/// Outcome of one key processed by `flush()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    pub key: String,
    pub success: bool,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Remote documents
// ---------------------------------------------------------------------------

/// Opaque body as written to the remote store, with its integrity digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub body: String,
    pub checksum: String,
    pub updated_at_ms: u64,
}

/// Returned to the caller of a queued save once the write landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReceipt {
    pub key: String,
    pub checksum: String,
    pub bytes: usize,
}

// ---------------------------------------------------------------------------
// Edit locks
// ---------------------------------------------------------------------------

/// Advisory cross-client lock as reported by the edit-lock collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLock {
    pub record_type: String,
    pub record_id: String,
    pub user_id: String,
    pub user_name: String,
    pub expires_at_ms: u64,
}

impl EditLock {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    /// A live lock held by someone else.
    pub fn blocks(&self, user_id: &str, now_ms: u64) -> bool {
        !self.is_owned_by(user_id) && !self.is_expired(now_ms)
    }

    pub fn record(&self) -> String {
        format!("{}:{}", self.record_type, self.record_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAcquisition {
    pub success: bool,
    pub reason: Option<String>,
    pub expires_at_ms: Option<u64>,
    pub locked_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRelease {
    pub success: bool,
}

/// Milliseconds since the Unix epoch, `0` if the system clock is before it.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps() {
        let cfg = RetryConfig {
            max_delay_ms: 1_000,
            ..RetryConfig::default()
        };
        assert_eq!(cfg.delay_for(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(400));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(800));
        assert_eq!(cfg.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(cfg.delay_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: ResilienceConfig =
            serde_json::from_str(r#"{"circuit_breaker":{"name":"ChunkedSyncCircuit","failure_threshold":3},"sync_queue":{"debounce_ms":1500}}"#)
                .unwrap();
        assert_eq!(cfg.circuit_breaker.failure_threshold, 3);
        assert_eq!(cfg.circuit_breaker.open_timeout_ms, DEFAULT_OPEN_TIMEOUT_MS);
        assert_eq!(cfg.sync_queue.debounce_ms, 1500);
        assert_eq!(cfg.sync_queue.name, "SyncQueue");
        assert_eq!(cfg.mutex.timeout_ms, DEFAULT_MUTEX_TIMEOUT_MS);
    }

    #[test]
    fn foreign_live_lock_blocks() {
        let lock = EditLock {
            record_type: "envelope".into(),
            record_id: "42".into(),
            user_id: "alice".into(),
            user_name: "Alice".into(),
            expires_at_ms: 1_000,
        };
        assert!(lock.blocks("bob", 999));
        assert!(!lock.blocks("bob", 1_000));
        assert!(!lock.blocks("alice", 0));
        assert_eq!(lock.record(), "envelope:42");
    }

    #[test]
    fn circuit_state_serializes_upper_case() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
    }
}
