//! Debouncing, superseding per-key operation queue.
//!
//! Each key holds at most one pending entry. Enqueuing again for the same
//! key rejects the previous entry with [`SyncError::Superseded`] and restarts
//! the debounce timer, so a burst of edits results in one remote write
//! carrying the last payload.
//!
//! Timers are spawned tasks tagged with a generation number. A timer whose
//! generation no longer matches the live entry is stale and does nothing.
//! A timer that fires while its key is still being processed is re-armed
//! instead of running the same key twice.

use crate::clock::Clock;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use syncguard_core::error::{SyncError, SyncResult};
use syncguard_core::{FlushResult, QueueStats, SyncQueueConfig, SyncQueueStatus};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

type BoxFuture<R> = Pin<Box<dyn Future<Output = SyncResult<R>> + Send>>;
type BoxOperation<P, R> = Box<dyn FnOnce(P) -> BoxFuture<R> + Send>;

struct Entry<P, R> {
    generation: u64,
    operation: BoxOperation<P, R>,
    payload: P,
    enqueued_at: Instant,
    responder: oneshot::Sender<SyncResult<R>>,
    timer: Option<JoinHandle<()>>,
}

impl<P, R> Entry<P, R> {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct QueueState<P, R> {
    pending: HashMap<String, Entry<P, R>>,
    processing: HashSet<String>,
    stats: QueueStats,
    next_generation: u64,
}

struct Inner<P, R> {
    config: SyncQueueConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState<P, R>>,
}

/// Cloneable handle; clones share one queue.
pub struct SyncQueue<P, R> {
    inner: Arc<Inner<P, R>>,
}

impl<P, R> Clone for SyncQueue<P, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, R> SyncQueue<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn new(config: SyncQueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                state: Mutex::new(QueueState {
                    pending: HashMap::new(),
                    processing: HashSet::new(),
                    stats: QueueStats::default(),
                    next_generation: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn state(&self) -> MutexGuard<'_, QueueState<P, R>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedules `operation(payload)` for `key` after the debounce window.
    ///
    /// Registration happens before this returns: a later `enqueue` for the
    /// same key supersedes this one even if the ticket is never polled.
    /// Must be called from within a Tokio runtime.
    pub fn enqueue<F, Fut>(&self, key: impl Into<String>, operation: F, payload: P) -> QueueTicket<R>
    where
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<R>> + Send + 'static,
    {
        let key = key.into();
        let (tx, rx) = oneshot::channel();
        let operation: BoxOperation<P, R> = Box::new(move |p| -> BoxFuture<R> { Box::pin(operation(p)) });

        let mut state = self.state();
        state.stats.enqueued += 1;
        let generation = state.next_generation;
        state.next_generation += 1;

        if let Some(mut previous) = state.pending.remove(&key) {
            previous.stop_timer();
            state.stats.superseded += 1;
            tracing::debug!(queue = %self.inner.config.name, key = %key, "superseded pending operation");
            let _ = previous.responder.send(Err(SyncError::Superseded {
                key: key.clone(),
                by: generation,
            }));
        }

        let timer = self.spawn_timer(key.clone(), generation);
        state.pending.insert(
            key.clone(),
            Entry {
                generation,
                operation,
                payload,
                enqueued_at: self.inner.clock.now(),
                responder: tx,
                timer: Some(timer),
            },
        );

        let pending = state.pending.len();
        let batch_limit = self.inner.config.max_batch_size;
        drop(state);
        tracing::debug!(queue = %self.inner.config.name, key = %key, generation, pending, "enqueued");

        if batch_limit > 0 && pending >= batch_limit {
            tracing::debug!(queue = %self.inner.config.name, pending, "batch limit reached, flushing early");
            let queue = self.clone();
            tokio::spawn(async move {
                queue.flush().await;
            });
        }

        QueueTicket { key, generation, rx }
    }

    fn spawn_timer(&self, key: String, generation: u64) -> JoinHandle<()> {
        let queue = self.clone();
        let debounce = self.inner.config.debounce();
        tokio::spawn(async move {
            queue.inner.clock.sleep(debounce).await;
            queue.fire(key, generation).await;
        })
    }

    async fn fire(&self, key: String, generation: u64) {
        let entry = {
            let mut state = self.state();
            match state.pending.get(&key) {
                Some(entry) if entry.generation == generation => {}
                _ => return,
            }

            if state.processing.contains(&key) {
                let timer = self.spawn_timer(key.clone(), generation);
                if let Some(entry) = state.pending.get_mut(&key) {
                    entry.timer = Some(timer);
                }
                tracing::debug!(queue = %self.inner.config.name, key = %key, "key busy, deferring");
                return;
            }

            let Some(mut entry) = state.pending.remove(&key) else {
                return;
            };
            // The handle belongs to this task; dropping it only detaches.
            entry.timer = None;
            state.processing.insert(key.clone());
            entry
        };

        self.run(key, entry).await;
    }

    /// Runs one entry that has already been moved into `processing`.
    ///
    /// Completion (marker, stats, responder) happens in a detached task, so
    /// dropping this future never frees the key while the operation is
    /// still running.
    async fn run(&self, key: String, entry: Entry<P, R>) -> FlushResult {
        let queue = self.clone();
        let task_key = key.clone();
        match tokio::spawn(async move { queue.complete(task_key, entry).await }).await {
            Ok(outcome) => outcome,
            Err(e) => FlushResult {
                key,
                success: false,
                error: Some(format!("completion task failed: {e}")),
            },
        }
    }

    async fn complete(&self, key: String, entry: Entry<P, R>) -> FlushResult {
        let Entry {
            operation,
            payload,
            enqueued_at,
            responder,
            ..
        } = entry;
        let mut marker = ProcessingGuard {
            inner: &self.inner,
            key: key.clone(),
            armed: true,
        };

        let waited_ms = self
            .inner
            .clock
            .now()
            .saturating_duration_since(enqueued_at)
            .as_millis() as u64;
        tracing::debug!(queue = %self.inner.config.name, key = %key, waited_ms, "processing");

        let result = match tokio::spawn(async move { operation(payload).await }).await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Internal(format!(
                "operation for '{key}' did not complete: {e}"
            ))),
        };

        {
            let mut state = self.state();
            state.processing.remove(&key);
            match &result {
                Ok(_) => state.stats.processed += 1,
                Err(_) => state.stats.failed += 1,
            }
        }
        marker.armed = false;

        let outcome = FlushResult {
            key: key.clone(),
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        };
        match &outcome.error {
            None => tracing::debug!(queue = %self.inner.config.name, key = %key, "processed"),
            Some(error) => tracing::warn!(queue = %self.inner.config.name, key = %key, error = %error, "operation failed"),
        }

        let _ = responder.send(result);
        outcome
    }

    /// Processes every pending key now, concurrently and independently.
    ///
    /// Keys already being processed are left pending with their timers. The
    /// results are sorted by key.
    pub async fn flush(&self) -> Vec<FlushResult> {
        let batch: Vec<(String, Entry<P, R>)> = {
            let mut state = self.state();
            let ready: Vec<String> = state
                .pending
                .keys()
                .filter(|key| !state.processing.contains(*key))
                .cloned()
                .collect();

            let mut batch = Vec::with_capacity(ready.len());
            for key in ready {
                if let Some(mut entry) = state.pending.remove(&key) {
                    entry.stop_timer();
                    state.processing.insert(key.clone());
                    batch.push((key, entry));
                }
            }
            batch
        };

        if batch.is_empty() {
            return Vec::new();
        }
        tracing::info!(queue = %self.inner.config.name, keys = batch.len(), "flushing");

        let mut set = JoinSet::new();
        for (key, entry) in batch {
            let queue = self.clone();
            set.spawn(async move { queue.run(key, entry).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => tracing::warn!(queue = %self.inner.config.name, error = %e, "flush task failed"),
            }
        }
        results.sort_by(|a, b| a.key.cmp(&b.key));
        results
    }

    /// Cancels every pending entry; callers receive [`SyncError::Cancelled`].
    /// Entries already running are not interrupted.
    pub fn clear(&self) -> usize {
        let drained: Vec<(String, Entry<P, R>)> = {
            let mut state = self.state();
            let drained: Vec<_> = state.pending.drain().collect();
            state.stats.cancelled += drained.len() as u64;
            drained
        };

        let count = drained.len();
        for (key, mut entry) in drained {
            entry.stop_timer();
            let _ = entry.responder.send(Err(SyncError::Cancelled {
                queue: self.inner.config.name.clone(),
                key,
            }));
        }
        if count > 0 {
            tracing::info!(queue = %self.inner.config.name, cancelled = count, "queue cleared");
        }
        count
    }

    pub fn stats(&self) -> QueueStats {
        self.state().stats
    }

    pub fn status(&self) -> SyncQueueStatus {
        let state = self.state();
        SyncQueueStatus {
            name: self.inner.config.name.clone(),
            pending: state.pending.len(),
            processing: state.processing.len(),
            stats: state.stats,
        }
    }
}

/// Clears the processing marker if `run` is dropped before it finishes.
struct ProcessingGuard<'a, P, R> {
    inner: &'a Inner<P, R>,
    key: String,
    armed: bool,
}

impl<P, R> Drop for ProcessingGuard<'_, P, R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.processing.remove(&self.key) {
            state.stats.failed += 1;
        }
    }
}

/// Resolves to the result of the enqueued operation, or to `Superseded` /
/// `Cancelled` if it never ran.
pub struct QueueTicket<R> {
    key: String,
    generation: u64,
    rx: oneshot::Receiver<SyncResult<R>>,
}

impl<R> QueueTicket<R> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Enqueue sequence number; `Superseded { by }` carries the successor's.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<R> Future for QueueTicket<R> {
    type Output = SyncResult<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SyncError::Internal(format!(
                "queue dropped '{}' without a result",
                this.key
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    type Log = Arc<Mutex<Vec<u32>>>;

    fn queue(debounce_ms: u64) -> SyncQueue<u32, u32> {
        SyncQueue::new(
            SyncQueueConfig {
                name: "test".into(),
                debounce_ms,
                max_batch_size: 50,
            },
            system_clock(),
        )
    }

    fn record(log: &Log) -> impl FnOnce(u32) -> std::future::Ready<SyncResult<u32>> + Send + 'static {
        let log = Arc::clone(log);
        move |p| {
            log.lock().unwrap().push(p);
            std::future::ready(Ok(p))
        }
    }

    fn reject(p: u32) -> std::future::Ready<SyncResult<u32>> {
        std::future::ready(Err(SyncError::Remote(format!("rejected {p}"))))
    }

    async fn explode(_: u32) -> SyncResult<u32> {
        panic!("operation panicked")
    }

    #[tokio::test(start_paused = true)]
    async fn newer_enqueue_supersedes_older() {
        let q = queue(50);
        let log = Log::default();

        let a = q.enqueue("envelope:1", record(&log), 1);
        let b = q.enqueue("envelope:1", record(&log), 2);

        let err = a.await.unwrap_err();
        assert!(err.is_superseded());
        assert!(err.to_string().contains("Superseded"));
        assert_eq!(b.await.unwrap(), 2);
        assert_eq!(*log.lock().unwrap(), vec![2]);
        assert_eq!(q.stats().superseded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_to_last_payload() {
        let q = queue(50);
        let log = Log::default();

        let tickets: Vec<_> = (1..=5)
            .map(|i| q.enqueue("envelope:42", record(&log), i))
            .collect();

        sleep(Duration::from_millis(40)).await;
        assert!(log.lock().unwrap().is_empty());

        sleep(Duration::from_millis(20)).await;
        assert_eq!(*log.lock().unwrap(), vec![5]);

        let mut superseded = 0;
        for ticket in tickets {
            match ticket.await {
                Ok(v) => assert_eq!(v, 5),
                Err(e) => {
                    assert!(e.is_superseded());
                    superseded += 1;
                }
            }
        }
        assert_eq!(superseded, 4);

        let stats = q.stats();
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.superseded, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn each_enqueue_restarts_debounce() {
        let q = queue(50);
        let log = Log::default();

        let _first = q.enqueue("bill:rent", record(&log), 1);
        sleep(Duration::from_millis(30)).await;
        let second = q.enqueue("bill:rent", record(&log), 2);
        sleep(Duration::from_millis(30)).await;
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(second.await.unwrap(), 2);
        assert_eq!(*log.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_payloads_still_supersede() {
        let q = queue(50);
        let log = Log::default();

        let a = q.enqueue("k", record(&log), 7);
        let b = q.enqueue("k", record(&log), 7);
        assert!(a.await.unwrap_err().is_superseded());
        assert_eq!(b.await.unwrap(), 7);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_isolates_failures() {
        let q = queue(10_000);
        let log = Log::default();

        let a = q.enqueue("a", record(&log), 1);
        let b = q.enqueue("b", reject, 2);
        let c = q.enqueue("c", record(&log), 3);

        let results = q.flush().await;
        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(results[1].key, "b");
        assert!(results[1].error.as_deref().unwrap().contains("rejected 2"));
        assert!(results[2].success);

        assert_eq!(a.await.unwrap(), 1);
        assert!(matches!(b.await, Err(SyncError::Remote(_))));
        assert_eq!(c.await.unwrap(), 3);

        let status = q.status();
        assert_eq!(status.pending, 0);
        assert_eq!(status.processing, 0);
        assert_eq!(status.stats.processed, 2);
        assert_eq!(status.stats.failed, 1);

        // Timers were cancelled by the flush.
        sleep(Duration::from_secs(20)).await;
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_pending() {
        let q = queue(50);
        let log = Log::default();

        let a = q.enqueue("a", record(&log), 1);
        let b = q.enqueue("b", record(&log), 2);
        assert_eq!(q.clear(), 2);

        assert!(matches!(a.await, Err(SyncError::Cancelled { ref key, .. }) if key == "a"));
        assert!(matches!(b.await, Err(SyncError::Cancelled { .. })));

        sleep(Duration::from_millis(100)).await;
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(q.stats().cancelled, 2);
        assert_eq!(q.clear(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_operation_fails_and_frees_key() {
        let q = queue(10);
        let log = Log::default();

        let ticket = q.enqueue("k", explode, 1);
        assert!(matches!(ticket.await, Err(SyncError::Internal(_))));

        let status = q.status();
        assert_eq!(status.processing, 0);
        assert_eq!(status.stats.failed, 1);

        assert_eq!(q.enqueue("k", record(&log), 2).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_key_defers_next_entry() {
        let q = queue(10);
        let log = Log::default();

        let slow = {
            let log = Arc::clone(&log);
            move |p: u32| async move {
                sleep(Duration::from_millis(100)).await;
                log.lock().unwrap().push(p);
                Ok(p)
            }
        };
        let first = q.enqueue("k", slow, 1);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(q.status().processing, 1);
        let second = q.enqueue("k", record(&log), 2);

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 2);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(q.stats().processed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_error_names_successor() {
        let q = queue(50);
        let log = Log::default();

        let a = q.enqueue("k", record(&log), 1);
        let b = q.enqueue("k", record(&log), 2);
        let successor = b.generation();
        assert!(successor > a.generation());

        assert!(matches!(a.await, Err(SyncError::Superseded { by, .. }) if by == successor));
        assert_eq!(b.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_flush_keeps_key_busy_until_operation_ends() {
        let q = queue(10_000);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let slow = |running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>| {
            move |p: u32| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, SyncError>(p)
            }
        };

        let first = q.enqueue("k", slow(Arc::clone(&running), Arc::clone(&peak)), 1);
        let abandoned = tokio::time::timeout(Duration::from_millis(10), q.flush()).await;
        assert!(abandoned.is_err());
        tokio::task::yield_now().await;
        assert_eq!(q.status().processing, 1);

        let second = q.enqueue("k", slow(Arc::clone(&running), Arc::clone(&peak)), 2);
        assert!(q.flush().await.is_empty());

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        let stats = q.stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_limit_flushes_early() {
        let q: SyncQueue<u32, u32> = SyncQueue::new(
            SyncQueueConfig {
                name: "batch".into(),
                debounce_ms: 10_000,
                max_batch_size: 3,
            },
            system_clock(),
        );
        let log = Log::default();
        let start = tokio::time::Instant::now();

        let tickets: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .zip(1..)
            .map(|(key, i)| q.enqueue(key, record(&log), i))
            .collect();
        for ticket in tickets {
            ticket.await.unwrap();
        }

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(log.lock().unwrap().len(), 3);
    }
}
