//! Sync service: debounced record saves, verified loads and chunked
//! snapshots for one remote endpoint.

use crate::mutex::SyncMutex;
use crate::queue::{QueueTicket, SyncQueue};
use crate::resilience::{ResilienceRegistry, SyncResilience};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use syncguard_core::error::{SyncError, SyncResult};
use syncguard_core::manifest::Manifest;
use syncguard_core::types::unix_millis;
use syncguard_core::{
    build_manifest, generate_checksum, validate_manifest, ChecksumValidator, CircuitStatus,
    FlushResult, MutexStatus, ResilienceConfig, StoredDocument, SyncQueueStatus, SyncReceipt,
};
use syncguard_provider::{EditLockProvider, RemoteStore};

/// Items per snapshot chunk unless overridden.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

const MANIFEST_KEY: &str = "snapshot/manifest";

fn chunk_key(chunk_id: &str) -> String {
    format!("snapshot/chunks/{chunk_id}")
}

/// `"<collection>_<index>"` -> `(collection, index)`.
fn split_chunk_id(chunk_id: &str) -> SyncResult<(&str, usize)> {
    chunk_id
        .rsplit_once('_')
        .and_then(|(name, index)| Some((name, index.parse().ok()?)))
        .ok_or_else(|| SyncError::InvalidInput(format!("malformed chunk id '{chunk_id}'")))
}

/// Splits each collection into chunks of at most `chunk_size` items. An
/// empty collection still gets one (empty) chunk so it survives a round trip.
fn split_collections(
    collections: &BTreeMap<String, Vec<Value>>,
    chunk_size: usize,
) -> BTreeMap<String, Value> {
    let mut chunks = BTreeMap::new();
    for (name, items) in collections {
        if items.is_empty() {
            chunks.insert(format!("{name}_0"), Value::Array(Vec::new()));
            continue;
        }
        for (i, part) in items.chunks(chunk_size).enumerate() {
            chunks.insert(format!("{name}_{i}"), Value::Array(part.to_vec()));
        }
    }
    chunks
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub user_id: String,
    pub queue: SyncQueueStatus,
    pub mutex: MutexStatus,
    pub circuit_breaker: CircuitStatus,
}

pub struct SyncService {
    store: Arc<dyn RemoteStore>,
    locks: Arc<dyn EditLockProvider>,
    user_id: String,
    mutex: Arc<SyncMutex>,
    resilience: Arc<SyncResilience>,
    queue: SyncQueue<Value, SyncReceipt>,
    chunk_size: usize,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        locks: Arc<dyn EditLockProvider>,
        user_id: impl Into<String>,
        registry: &ResilienceRegistry,
        config: &ResilienceConfig,
    ) -> Self {
        let resilience = Arc::new(registry.resilience(config));
        let queue = resilience.new_queue();
        Self {
            store,
            locks,
            user_id: user_id.into(),
            mutex: registry.mutex(config.mutex.clone()),
            resilience,
            queue,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Schedules a debounced write of `document` to `"<type>:<id>"`.
    ///
    /// A later save of the same record before the debounce window closes
    /// supersedes this one. When the write runs, a live edit lock held by
    /// another user refuses it with [`SyncError::EditLocked`].
    pub fn save(&self, record_type: &str, record_id: &str, document: Value) -> QueueTicket<SyncReceipt> {
        let key = format!("{record_type}:{record_id}");
        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        let resilience = Arc::clone(&self.resilience);
        let user_id = self.user_id.clone();
        let record_type = record_type.to_string();
        let record_id = record_id.to_string();
        let remote_key = key.clone();

        self.queue.enqueue(
            key,
            move |document: Value| async move {
                if let Some(lock) = locks.inspect(&record_type, &record_id).await? {
                    if lock.blocks(&user_id, unix_millis()) {
                        tracing::info!(record = %lock.record(), locked_by = %lock.user_name, "save refused by edit lock");
                        return Err(SyncError::EditLocked {
                            record: lock.record(),
                            locked_by: lock.user_name,
                        });
                    }
                }

                let body = serde_json::to_string(&document)?;
                let checksum = generate_checksum(&body);
                let bytes = body.len();
                let stored = StoredDocument {
                    body,
                    checksum: checksum.clone(),
                    updated_at_ms: unix_millis(),
                };

                resilience
                    .execute("save", || store.put(&remote_key, stored.clone()))
                    .await?;
                tracing::info!(key = %remote_key, bytes, "record saved");

                Ok(SyncReceipt {
                    key: remote_key,
                    checksum,
                    bytes,
                })
            },
            document,
        )
    }

    /// Reads a record and verifies its stored checksum before parsing.
    pub async fn load(&self, record_type: &str, record_id: &str) -> SyncResult<Option<Value>> {
        let key = format!("{record_type}:{record_id}");
        match self.fetch_verified(&key).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, body: String, updated_at_ms: u64) -> SyncResult<()> {
        let document = StoredDocument {
            checksum: generate_checksum(&body),
            body,
            updated_at_ms,
        };
        self.resilience
            .execute("put", || self.store.put(key, document.clone()))
            .await
    }

    async fn fetch_verified(&self, key: &str) -> SyncResult<Option<String>> {
        let Some(document) = self
            .resilience
            .execute("get", || self.store.get(key))
            .await?
        else {
            return Ok(None);
        };
        ChecksumValidator::default().verify(key, &document.body, &document.checksum)?;
        Ok(Some(document.body))
    }

    /// Writes every collection as checksummed chunks followed by the
    /// manifest, under the service mutex. Returns the written manifest.
    pub async fn save_snapshot(&self, collections: &BTreeMap<String, Vec<Value>>) -> SyncResult<Manifest> {
        self.mutex
            .execute("saveSnapshot", move || async move {
                let chunks = split_collections(collections, self.chunk_size);
                let mut extra = Map::new();
                extra.insert(
                    "collections".into(),
                    Value::Array(collections.keys().cloned().map(Value::String).collect()),
                );
                let manifest = build_manifest(&chunks, extra, unix_millis())?;

                for (chunk_id, data) in &chunks {
                    self.put(&chunk_key(chunk_id), serde_json::to_string(data)?, manifest.timestamp)
                        .await?;
                }
                // Manifest last: a reader never sees a manifest whose chunks are missing.
                self.put(MANIFEST_KEY, serde_json::to_string(&manifest)?, manifest.timestamp)
                    .await?;

                tracing::info!(
                    chunks = manifest.metadata.total_chunks,
                    bytes = manifest.metadata.total_size,
                    "snapshot saved"
                );
                Ok::<_, SyncError>(manifest)
            })
            .await
    }

    /// Reads the manifest and every chunk it lists, verifying each, and
    /// reassembles the collections. `None` if no snapshot was ever written.
    pub async fn load_snapshot(&self) -> SyncResult<Option<BTreeMap<String, Vec<Value>>>> {
        self.mutex
            .execute("loadSnapshot", move || async move {
                let Some(body) = self.fetch_verified(MANIFEST_KEY).await? else {
                    return Ok(None);
                };
                let value: Value = serde_json::from_str(&body)?;

                let report = validate_manifest(&value, "load", unix_millis());
                for warning in &report.warnings {
                    tracing::warn!(warning = %warning, "manifest warning");
                }
                if !report.is_valid {
                    return Err(SyncError::InvalidInput(format!(
                        "invalid manifest: {}",
                        report.errors.join("; ")
                    )));
                }

                let manifest: Manifest = serde_json::from_value(value)?;
                manifest.verify_checksum()?;

                let mut parts: BTreeMap<String, Vec<(usize, Vec<Value>)>> = BTreeMap::new();
                for chunk_id in manifest.chunks.keys() {
                    let body = self
                        .fetch_verified(&chunk_key(chunk_id))
                        .await?
                        .ok_or_else(|| SyncError::InvalidInput(format!("chunk {chunk_id} is missing")))?;
                    let data: Value = serde_json::from_str(&body)?;
                    manifest.verify_chunk(chunk_id, &data)?;

                    let (name, index) = split_chunk_id(chunk_id)?;
                    let items = match data {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    parts.entry(name.to_string()).or_default().push((index, items));
                }

                let collections: BTreeMap<String, Vec<Value>> = parts
                    .into_iter()
                    .map(|(name, mut chunks)| {
                        chunks.sort_by_key(|(index, _)| *index);
                        (name, chunks.into_iter().flat_map(|(_, items)| items).collect())
                    })
                    .collect();

                tracing::info!(chunks = manifest.chunks.len(), "snapshot loaded");
                Ok::<_, SyncError>(Some(collections))
            })
            .await
    }

    /// Runs every pending save now.
    pub async fn flush(&self) -> Vec<FlushResult> {
        self.queue.flush().await
    }

    /// Cancels pending saves. Returns how many were dropped.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.queue.clear();
        tracing::info!(user = %self.user_id, cancelled, "sync service shut down");
        cancelled
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            user_id: self.user_id.clone(),
            queue: self.queue.status(),
            mutex: self.mutex.status(),
            circuit_breaker: self.resilience.breaker().status(),
        }
    }
}
