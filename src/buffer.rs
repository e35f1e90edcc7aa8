//! Batching, backpressure-aware sink between the processor and the store.
//!
//! Records are optionally made durable in the journal before they enter the
//! in-memory pending list. Batches are handed to a single flush worker over
//! a bounded queue; when the queue is full the producer flushes inline as a
//! safety valve. The journal's committed pointer advances only after the
//! store reports success for a batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::journal::Journal;
use crate::model::{BatchInsert, LogRecord, LogSink, next_event_id};

/// Backoff between journal append retries.
const APPEND_RETRY_BACKOFF: Duration = Duration::from_millis(200);
/// Minimum interval between backpressure warnings.
const BACKPRESSURE_WARN_INTERVAL: Duration = Duration::from_secs(10);

pub struct InsertBufferConfig {
    /// Max records per flushed batch.
    pub batch_size: usize,
    /// Cadence of the periodic drain.
    pub flush_interval: Duration,
    /// Bounded handoff queue depth (batches awaiting the flush worker).
    pub flush_queue_size: usize,
    /// Optional durable journal.
    pub journal: Option<Journal>,
}

impl Default for InsertBufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 2000,
            flush_interval: Duration::from_millis(100),
            flush_queue_size: 64,
            journal: None,
        }
    }
}

type Batch = Vec<(u64, LogRecord)>;

struct Shared {
    store: Arc<dyn BatchInsert>,
    journal: Option<Journal>,
    pending: Mutex<Batch>,
    /// Taken on stop so the flush worker can drain and exit.
    flush_tx: Mutex<Option<mpsc::Sender<Batch>>>,
    shutdown_tx: watch::Sender<bool>,
    inline_flushes: AtomicU64,
    last_backpressure_warn: Mutex<Option<Instant>>,
}

pub struct InsertBuffer {
    shared: Arc<Shared>,
    batch_size: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InsertBuffer {
    /// Spawn the flush worker and periodic drain ticker. Must be called
    /// within a tokio runtime.
    pub fn new(store: Arc<dyn BatchInsert>, config: InsertBufferConfig) -> Self {
        let (flush_tx, flush_rx) = mpsc::channel(config.flush_queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            store,
            journal: config.journal,
            pending: Mutex::new(Vec::new()),
            flush_tx: Mutex::new(Some(flush_tx)),
            shutdown_tx,
            inline_flushes: AtomicU64::new(0),
            last_backpressure_warn: Mutex::new(None),
        });

        let worker = tokio::spawn(flush_worker(shared.clone(), flush_rx));
        let ticker = tokio::spawn(drain_ticker(
            shared.clone(),
            shutdown_rx,
            config.flush_interval,
        ));

        Self {
            shared,
            batch_size: config.batch_size.max(1),
            tasks: Mutex::new(vec![worker, ticker]),
        }
    }

    /// Queue one record for insertion.
    ///
    /// Assigns the event id if absent and, when a journal is attached,
    /// durably appends the record first (retrying until success or
    /// shutdown). Never blocks on the store in the steady state.
    pub async fn add(&self, mut record: LogRecord) {
        if record.event_id.is_empty() {
            record.event_id = next_event_id();
        }

        let seq = match &self.shared.journal {
            Some(journal) => loop {
                match journal.append(&record) {
                    Ok(seq) => break seq,
                    Err(e) => {
                        if *self.shared.shutdown_tx.borrow() {
                            tracing::warn!(error = %e, "journal unavailable during shutdown, record continues unjournaled");
                            break 0;
                        }
                        tracing::warn!(error = %e, "journal append failed, retrying");
                        tokio::time::sleep(APPEND_RETRY_BACKOFF).await;
                    }
                }
            },
            None => 0,
        };

        let full_batch = {
            let mut pending = self.shared.pending.lock().expect("pending mutex poisoned");
            pending.push((seq, record));
            if pending.len() >= self.batch_size {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            dispatch(&self.shared, batch).await;
        }
    }

    /// Total number of inline flushes forced by a full handoff queue.
    pub fn inline_flush_count(&self) -> u64 {
        self.shared.inline_flushes.load(Ordering::Relaxed)
    }

    /// Signal shutdown, drain pending entries, wait for the flush worker,
    /// then close the journal. Idempotent.
    pub async fn stop(&self) {
        let already_stopped = self.shared.shutdown_tx.send_replace(true);
        if !already_stopped {
            let batch = {
                let mut pending = self.shared.pending.lock().expect("pending mutex poisoned");
                std::mem::take(&mut *pending)
            };
            if !batch.is_empty() {
                dispatch(&self.shared, batch).await;
            }
            // Drop the sender so the worker drains the queue and exits.
            self.shared
                .flush_tx
                .lock()
                .expect("flush sender mutex poisoned")
                .take();
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task mutex poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        if let Some(journal) = &self.shared.journal
            && let Err(e) = journal.close()
        {
            tracing::warn!(error = %e, "journal close failed");
        }
    }
}

#[async_trait]
impl LogSink for InsertBuffer {
    async fn add(&self, record: LogRecord) {
        InsertBuffer::add(self, record).await;
    }
}

// ---------------------------------------------------------------------------
// Batch handoff and flushing
// ---------------------------------------------------------------------------

/// Hand a batch to the flush worker; flush inline when the queue is full or
/// already closed.
async fn dispatch(shared: &Shared, batch: Batch) {
    let sender = shared
        .flush_tx
        .lock()
        .expect("flush sender mutex poisoned")
        .clone();

    let rejected = match sender {
        Some(tx) => match tx.try_send(batch) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(batch)) => {
                shared.inline_flushes.fetch_add(1, Ordering::Relaxed);
                warn_backpressure(shared);
                batch
            }
            Err(mpsc::error::TrySendError::Closed(batch)) => batch,
        },
        None => batch,
    };

    flush_batch(shared, rejected).await;
}

fn warn_backpressure(shared: &Shared) {
    let mut last = shared
        .last_backpressure_warn
        .lock()
        .expect("backpressure mutex poisoned");
    let now = Instant::now();
    if last.is_none_or(|t| now.duration_since(t) >= BACKPRESSURE_WARN_INTERVAL) {
        *last = Some(now);
        tracing::warn!(
            inline_flushes = shared.inline_flushes.load(Ordering::Relaxed),
            "flush queue full, flushing inline"
        );
    }
}

async fn flush_worker(shared: Arc<Shared>, mut rx: mpsc::Receiver<Batch>) {
    while let Some(batch) = rx.recv().await {
        flush_batch(&shared, batch).await;
    }
}

/// Insert one batch and, on success, advance the journal's committed
/// pointer to the batch's highest sequence. A failed batch is logged, never
/// retried here; the store salvages per record internally.
async fn flush_batch(shared: &Shared, batch: Batch) {
    if batch.is_empty() {
        return;
    }
    let max_seq = batch.iter().map(|(seq, _)| *seq).max().unwrap_or(0);
    let records: Vec<LogRecord> = batch.into_iter().map(|(_, record)| record).collect();

    match shared.store.insert_batch(&records).await {
        Ok(()) => {
            if max_seq > 0
                && let Some(journal) = &shared.journal
                && let Err(e) = journal.commit(max_seq)
            {
                tracing::error!(error = %e, seq = max_seq, "journal commit failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, count = records.len(), "batch insert failed");
        }
    }
}

async fn drain_ticker(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>, period: Duration) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tick.tick() => {
                let batch = {
                    let mut pending = shared.pending.lock().expect("pending mutex poisoned");
                    if pending.is_empty() {
                        continue;
                    }
                    std::mem::take(&mut *pending)
                };
                dispatch(&shared, batch).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    struct RecordingStore {
        rows: tokio::sync::Mutex<Vec<LogRecord>>,
        delay: Duration,
    }

    impl RecordingStore {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                rows: tokio::sync::Mutex::new(Vec::new()),
                delay,
            })
        }

        async fn rows(&self) -> Vec<LogRecord> {
            self.rows.lock().await.clone()
        }
    }

    #[async_trait]
    impl BatchInsert for RecordingStore {
        async fn insert_batch(&self, records: &[LogRecord]) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.rows.lock().await.extend_from_slice(records);
            Ok(())
        }
    }

    fn record(message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            orig_timestamp: None,
            level: "INFO".into(),
            level_num: 30,
            message: message.into(),
            raw_line: message.into(),
            service: "svc".into(),
            hostname: String::new(),
            pid: None,
            attributes: Default::default(),
            source: "tcp".into(),
            app: "default".into(),
            event_id: String::new(),
        }
    }

    #[tokio::test]
    async fn assigns_unique_event_ids_and_preserves_fifo() {
        let store = RecordingStore::new(Duration::ZERO);
        let buffer = InsertBuffer::new(
            store.clone(),
            InsertBufferConfig {
                batch_size: 3,
                flush_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        for i in 0..7 {
            buffer.add(record(&format!("m{i}"))).await;
        }
        buffer.stop().await;

        let rows = store.rows().await;
        assert_eq!(rows.len(), 7);
        let messages: Vec<&str> = rows.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, ["m0", "m1", "m2", "m3", "m4", "m5", "m6"]);

        let mut ids: Vec<&str> = rows.iter().map(|r| r.event_id.as_str()).collect();
        assert!(ids.iter().all(|id| !id.is_empty()));
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 7);
    }

    #[tokio::test]
    async fn full_queue_forces_inline_flush_without_losing_records() {
        let store = RecordingStore::new(Duration::from_millis(200));
        let buffer = InsertBuffer::new(
            store.clone(),
            InsertBufferConfig {
                batch_size: 1,
                flush_interval: Duration::from_secs(60),
                flush_queue_size: 1,
                journal: None,
            },
        );

        for i in 0..4 {
            buffer.add(record(&format!("m{i}"))).await;
        }
        buffer.stop().await;

        assert!(buffer.inline_flush_count() >= 1, "expected inline flushes");
        assert_eq!(store.rows().await.len(), 4);
    }

    #[tokio::test]
    async fn journal_commit_advances_after_store_success() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path().join("wal.jsonl")).unwrap();
        let store = RecordingStore::new(Duration::ZERO);
        let buffer = InsertBuffer::new(
            store.clone(),
            InsertBufferConfig {
                batch_size: 2,
                flush_interval: Duration::from_millis(10),
                journal: Some(journal),
                ..Default::default()
            },
        );

        for i in 0..4 {
            buffer.add(record(&format!("m{i}"))).await;
        }
        buffer.stop().await;
        assert_eq!(store.rows().await.len(), 4);

        // All four entries were journaled and committed; a reopened journal
        // has nothing left to replay.
        let reopened = Journal::open(dir.path().join("wal.jsonl")).unwrap();
        assert_eq!(reopened.committed(), 4);
        let mut replayed = 0;
        reopened
            .replay(|_, _| {
                replayed += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(replayed, 0);
    }

    #[tokio::test]
    async fn stop_tolerates_a_second_call() {
        let store = RecordingStore::new(Duration::ZERO);
        let buffer = InsertBuffer::new(store.clone(), InsertBufferConfig::default());
        buffer.add(record("only")).await;
        buffer.stop().await;
        buffer.stop().await;
        assert_eq!(store.rows().await.len(), 1);
    }
}
