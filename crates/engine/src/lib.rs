//! Reliability primitives for offline-first sync: named mutex, circuit
//! breaker, debouncing sync queue, retry policy, and the service wiring them
//! to a remote store.

pub mod circuit;
pub mod clock;
pub mod mutex;
pub mod queue;
pub mod resilience;
pub mod retry;
pub mod service;

pub use circuit::CircuitBreaker;
pub use clock::{system_clock, Clock, ManualClock, TokioClock};
pub use mutex::SyncMutex;
pub use queue::{QueueTicket, SyncQueue};
pub use resilience::{RegistryStatus, ResilienceRegistry, SyncResilience};
pub use retry::RetryPolicy;
pub use service::{ServiceStatus, SyncService, DEFAULT_CHUNK_SIZE};
