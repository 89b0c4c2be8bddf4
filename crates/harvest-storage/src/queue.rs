//! Write-behind persistence queue.
//!
//! Batches are accepted immediately and flushed by a single drainer task that
//! owns the FIFO. At most `max_concurrent` persists run at once. A failed
//! batch goes back to the tail; once it reaches the head again it is held
//! there until its backoff has elapsed, which also holds every item behind it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use harvest_core::HarvestRecord;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{BackoffPolicy, PersistenceError, RecordStore, StoredRecord};

#[derive(Debug, Clone)]
pub struct WriteBehindConfig {
    pub max_concurrent: usize,
    /// Total persist attempts per batch before it is dropped.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub command_capacity: usize,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            command_capacity: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: Uuid,
    pub owner_id: String,
    pub session_ref: String,
    pub records: Vec<HarvestRecord>,
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
    retry_delay: Duration,
}

impl QueueItem {
    pub fn new(
        owner_id: impl Into<String>,
        session_ref: impl Into<String>,
        records: Vec<HarvestRecord>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            session_ref: session_ref.into(),
            records,
            attempts: 0,
            last_attempt: None,
            retry_delay: Duration::ZERO,
        }
    }

    /// When a previously failed item may be tried again.
    fn ready_at(&self) -> Option<Instant> {
        if self.attempts == 0 {
            return None;
        }
        self.last_attempt.map(|at| at + self.retry_delay)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub persisted: u64,
    pub retried: u64,
    pub dropped: u64,
}

#[derive(Debug, Error)]
#[error("write-behind queue is shut down")]
pub struct QueueClosed;

enum Command {
    Enqueue(QueueItem),
    Stats(oneshot::Sender<QueueStats>),
    Shutdown(oneshot::Sender<QueueStats>),
}

/// Cloneable handle to the drainer task.
#[derive(Debug, Clone)]
pub struct WriteBehindQueue {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Enqueue(item) => f.debug_tuple("Enqueue").field(&item.id).finish(),
            Command::Stats(_) => f.write_str("Stats"),
            Command::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl WriteBehindQueue {
    /// Spawns the drainer on the current runtime.
    pub fn start(store: Arc<dyn RecordStore>, config: WriteBehindConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let drainer = Drainer {
            store,
            config,
            items: VecDeque::new(),
            in_flight: JoinSet::new(),
            stats: QueueStats::default(),
        };
        tokio::spawn(drainer.run(rx));
        Self { tx }
    }

    pub async fn enqueue(
        &self,
        owner_id: impl Into<String>,
        session_ref: impl Into<String>,
        records: Vec<HarvestRecord>,
    ) -> Result<Uuid, QueueClosed> {
        let item = QueueItem::new(owner_id, session_ref, records);
        let id = item.id;
        self.tx
            .send(Command::Enqueue(item))
            .await
            .map_err(|_| QueueClosed)?;
        Ok(id)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Stats(reply)).await.map_err(|_| QueueClosed)?;
        rx.await.map_err(|_| QueueClosed)
    }

    /// Stops accepting batches and resolves once every pending and in-flight
    /// batch has been persisted or dropped.
    pub async fn shutdown(&self) -> Result<QueueStats, QueueClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply))
            .await
            .map_err(|_| QueueClosed)?;
        rx.await.map_err(|_| QueueClosed)
    }
}

/// Resolves the owner and writes the whole batch in one transaction.
pub async fn persist(store: &dyn RecordStore, item: &QueueItem) -> Result<u64, PersistenceError> {
    let owner = store.resolve_owner(&item.owner_id).await?;
    let mut tx = store.begin().await?;
    let rows = item
        .records
        .iter()
        .map(|record| StoredRecord::from_record(&owner, &item.session_ref, record))
        .collect::<Result<Vec<_>, _>>()?;
    let written = tx.write_records(&rows).await?;
    tx.commit().await?;
    Ok(written)
}

struct PersistOutcome {
    item: QueueItem,
    result: Result<u64, PersistenceError>,
}

struct Drainer {
    store: Arc<dyn RecordStore>,
    config: WriteBehindConfig,
    items: VecDeque<QueueItem>,
    in_flight: JoinSet<PersistOutcome>,
    stats: QueueStats,
}

impl Drainer {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut accepting = true;
        let mut closing: Vec<oneshot::Sender<QueueStats>> = Vec::new();

        loop {
            let wake_at = self.drain();
            if !accepting && self.items.is_empty() && self.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                cmd = rx.recv(), if accepting => match cmd {
                    Some(Command::Enqueue(item)) => {
                        debug!(
                            item_id = %item.id,
                            records = item.records.len(),
                            "write-behind batch queued"
                        );
                        self.items.push_back(item);
                    }
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Shutdown(reply)) => {
                        // Buffered commands are still delivered; new sends fail.
                        rx.close();
                        closing.push(reply);
                    }
                    None => accepting = false,
                },
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.on_persisted(joined);
                }
                _ = sleep_until_or_pending(wake_at) => {}
            }
        }

        let stats = self.snapshot();
        info!(
            persisted = stats.persisted,
            dropped = stats.dropped,
            retried = stats.retried,
            "write-behind queue drained"
        );
        for reply in closing {
            let _ = reply.send(stats);
        }
    }

    /// Dispatches head items while capacity allows. Returns the instant at
    /// which a backed-off head becomes eligible, if that is what stopped it.
    fn drain(&mut self) -> Option<Instant> {
        while self.in_flight.len() < self.config.max_concurrent.max(1) {
            let ready_at = self.items.front()?.ready_at();
            if let Some(ready_at) = ready_at {
                if ready_at > Instant::now() {
                    return Some(ready_at);
                }
            }
            let item = self.items.pop_front()?;
            self.dispatch(item);
        }
        None
    }

    fn dispatch(&mut self, item: QueueItem) {
        let store = Arc::clone(&self.store);
        let span = info_span!(
            "persist",
            item_id = %item.id,
            owner_id = %item.owner_id,
            attempt = item.attempts + 1
        );
        self.in_flight.spawn(
            async move {
                // The batch stays owned out here so a panicking persist is
                // retried like any other failure.
                let batch = item.clone();
                let attempt = tokio::spawn(
                    async move { persist(store.as_ref(), &batch).await }.in_current_span(),
                );
                let result = attempt.await.unwrap_or_else(|err| {
                    Err(PersistenceError::Message(format!("persist task failed: {err}")))
                });
                PersistOutcome { item, result }
            }
            .instrument(span),
        );
    }

    fn on_persisted(&mut self, joined: Result<PersistOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                self.stats.dropped += 1;
                error!(
                    error = %err,
                    in_flight = self.in_flight.len(),
                    "persist supervisor aborted; batch lost"
                );
                return;
            }
        };

        let PersistOutcome { mut item, result } = outcome;
        match result {
            Ok(written) => {
                self.stats.persisted += 1;
                info!(
                    item_id = %item.id,
                    owner_id = %item.owner_id,
                    records = item.records.len(),
                    written,
                    "write-behind batch persisted"
                );
            }
            Err(err) => {
                item.attempts += 1;
                item.last_attempt = Some(Instant::now());
                if item.attempts < self.config.max_retries {
                    item.retry_delay = self.config.backoff.delay_for_attempt(item.attempts);
                    self.stats.retried += 1;
                    warn!(
                        item_id = %item.id,
                        attempts = item.attempts,
                        retry_in_ms = item.retry_delay.as_millis() as u64,
                        error = %err,
                        "persist failed; batch requeued"
                    );
                    self.items.push_back(item);
                } else {
                    self.stats.dropped += 1;
                    error!(
                        item_id = %item.id,
                        owner_id = %item.owner_id,
                        session_ref = %item.session_ref,
                        attempts = item.attempts,
                        records = item.records.len(),
                        error = %err,
                        "persist failed permanently; batch dropped"
                    );
                }
            }
        }
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            pending: self.items.len(),
            in_flight: self.in_flight.len(),
            ..self.stats
        }
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryRecordStore, Owner, RecordTransaction};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn records(prefix: &str, count: usize) -> Vec<HarvestRecord> {
        (0..count)
            .map(|i| HarvestRecord {
                id: format!("{prefix}-{i}"),
                url: None,
                title: None,
                body: None,
                captured_at: Utc::now(),
                attributes: Map::new(),
            })
            .collect()
    }

    fn session_order(rows: &[StoredRecord]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for row in rows {
            if out.last() != Some(&row.session_ref) {
                out.push(row.session_ref.clone());
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn enqueued_batch_is_persisted() {
        let store = MemoryRecordStore::new();
        let queue = WriteBehindQueue::start(Arc::new(store.clone()), WriteBehindConfig::default());

        queue.enqueue("user_1", "job-a", records("a", 4)).await.unwrap();
        let stats = queue.shutdown().await.unwrap();

        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(store.records().await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let store = MemoryRecordStore::new();
        store.fail_next(2).await;
        let queue = WriteBehindQueue::start(Arc::new(store.clone()), WriteBehindConfig::default());
        let started = Instant::now();

        queue.enqueue("user_1", "job-a", records("a", 2)).await.unwrap();
        let stats = queue.shutdown().await.unwrap();

        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(store.write_attempts().await, 3);
        // backoff(1) >= 1s and backoff(2) >= 2s
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_dropped_after_three_failed_attempts() {
        let store = MemoryRecordStore::new();
        store.fail_next(10).await;
        let queue = WriteBehindQueue::start(Arc::new(store.clone()), WriteBehindConfig::default());

        queue.enqueue("user_1", "job-a", records("a", 2)).await.unwrap();
        let stats = queue.shutdown().await.unwrap();

        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.persisted, 0);
        assert_eq!(store.write_attempts().await, 3);
        assert!(store.records().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backed_off_head_blocks_later_items() {
        let store = MemoryRecordStore::new();
        store.fail_next(1).await;
        let queue = WriteBehindQueue::start(Arc::new(store.clone()), WriteBehindConfig::default());

        queue.enqueue("user_1", "job-a", records("a", 1)).await.unwrap();
        while queue.stats().await.unwrap().retried == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        queue.enqueue("user_2", "job-b", records("b", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mid = queue.stats().await.unwrap();
        assert_eq!(mid.pending, 2);
        assert_eq!(mid.in_flight, 0);

        queue.shutdown().await.unwrap();
        assert_eq!(session_order(&store.records().await), vec!["job-a", "job-b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_item_is_requeued_behind_waiting_items() {
        let store = MemoryRecordStore::new();
        store.fail_next(1).await;
        let config = WriteBehindConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let queue = WriteBehindQueue::start(Arc::new(store.clone()), config);

        queue.enqueue("user_1", "job-a", records("a", 1)).await.unwrap();
        queue.enqueue("user_2", "job-b", records("b", 1)).await.unwrap();
        queue.shutdown().await.unwrap();

        assert_eq!(session_order(&store.records().await), vec!["job-b", "job-a"]);
    }

    struct SlowStore {
        inner: MemoryRecordStore,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    struct SlowTransaction {
        inner: Box<dyn RecordTransaction>,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RecordStore for SlowStore {
        async fn resolve_owner(&self, owner_id: &str) -> Result<Owner, PersistenceError> {
            self.inner.resolve_owner(owner_id).await
        }

        async fn begin(&self) -> Result<Box<dyn RecordTransaction>, PersistenceError> {
            Ok(Box::new(SlowTransaction {
                inner: self.inner.begin().await?,
                current: Arc::clone(&self.current),
                peak: Arc::clone(&self.peak),
            }))
        }
    }

    #[async_trait]
    impl RecordTransaction for SlowTransaction {
        async fn write_records(
            &mut self,
            records: &[StoredRecord],
        ) -> Result<u64, PersistenceError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let written = self.inner.write_records(records).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            written
        }

        async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
            self.inner.commit().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_persists_never_exceed_limit() {
        let inner = MemoryRecordStore::new();
        let peak = Arc::new(AtomicUsize::new(0));
        let store = SlowStore {
            inner: inner.clone(),
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        };
        let queue = WriteBehindQueue::start(Arc::new(store), WriteBehindConfig::default());

        for i in 0..10 {
            queue
                .enqueue(format!("user_{i}"), format!("job-{i}"), records("r", 2))
                .await
                .unwrap();
        }
        let stats = queue.shutdown().await.unwrap();

        assert_eq!(stats.persisted, 10);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(inner.records().await.len(), 20);
    }

    /// Panics on the first `panics` owner lookups, then delegates.
    struct PanickingStore {
        inner: MemoryRecordStore,
        panics: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for PanickingStore {
        async fn resolve_owner(&self, owner_id: &str) -> Result<Owner, PersistenceError> {
            let remaining = self.panics.load(Ordering::SeqCst);
            if remaining > 0 {
                self.panics.store(remaining - 1, Ordering::SeqCst);
                panic!("owner lookup blew up");
            }
            self.inner.resolve_owner(owner_id).await
        }

        async fn begin(&self) -> Result<Box<dyn RecordTransaction>, PersistenceError> {
            self.inner.begin().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_persist_is_retried() {
        let inner = MemoryRecordStore::new();
        let store = PanickingStore {
            inner: inner.clone(),
            panics: AtomicUsize::new(1),
        };
        let queue = WriteBehindQueue::start(Arc::new(store), WriteBehindConfig::default());

        queue.enqueue("user_1", "job-a", records("a", 3)).await.unwrap();
        let stats = queue.shutdown().await.unwrap();

        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(inner.records().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_that_always_panics_is_dropped_after_retries() {
        let inner = MemoryRecordStore::new();
        let store = PanickingStore {
            inner: inner.clone(),
            panics: AtomicUsize::new(usize::MAX),
        };
        let queue = WriteBehindQueue::start(Arc::new(store), WriteBehindConfig::default());

        queue.enqueue("user_1", "job-a", records("a", 1)).await.unwrap();
        queue.enqueue("user_2", "job-b", records("b", 1)).await.unwrap();
        let stats = queue.shutdown().await.unwrap();

        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.retried, 4);
        assert!(inner.records().await.is_empty());
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let queue = WriteBehindQueue::start(
            Arc::new(MemoryRecordStore::new()),
            WriteBehindConfig::default(),
        );
        queue.shutdown().await.unwrap();
        assert!(queue.enqueue("user_1", "job-a", records("a", 1)).await.is_err());
        assert!(queue.stats().await.is_err());
    }
}
