//! Canonical record and aggregation DTOs shared across the pipeline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Canonical record
// ---------------------------------------------------------------------------

/// The normalized log record persisted by the store.
///
/// Created by the extractor, enriched by the processor, and never mutated
/// after the processor finishes. `timestamp` is the receive time and is
/// always set; `orig_timestamp` is the log-origin time when it could be
/// recovered from the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_timestamp: Option<DateTime<Utc>>,
    /// One of TRACE, DEBUG, INFO, WARN, ERROR, FATAL, CRITICAL, UNKNOWN.
    pub level: String,
    pub level_num: i64,
    pub message: String,
    pub raw_line: String,
    pub service: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Key-unique attribute map. Never null; may be empty.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Ingestion tag: `tcp`, `stdin`, `file`, ...
    pub source: String,
    /// Application bucket; coerced to "default" at insert when empty.
    #[serde(default)]
    pub app: String,
    /// Globally unique id, assigned before journaling.
    #[serde(default)]
    pub event_id: String,
}

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique event id: `<unix-nanos-hex>-<counter-hex>`.
pub fn next_event_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let n = EVENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{nanos:x}-{n:x}")
}

// ---------------------------------------------------------------------------
// Ingest envelope
// ---------------------------------------------------------------------------

/// One raw line flowing from an ingest source into the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub line: String,
}

// ---------------------------------------------------------------------------
// Aggregation DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordCount {
    pub word: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeStat {
    pub key: String,
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeKeyStat {
    pub key: String,
    pub unique_values: i64,
    pub total_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionCount {
    pub value: String,
    pub count: i64,
}

/// Per-minute severity breakdown. `minute` is an ISO minute key,
/// e.g. `2026-08-01T12:34`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteCounts {
    pub minute: String,
    pub trace: i64,
    pub debug: i64,
    pub info: i64,
    pub warn: i64,
    pub error: i64,
    pub fatal: i64,
    pub total: i64,
}

/// Common filter accepted by every read method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOpts {
    #[serde(default, alias = "App", skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
}

impl QueryOpts {
    pub fn for_app(app: impl Into<String>) -> Self {
        Self {
            app: Some(app.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Interface contracts
// ---------------------------------------------------------------------------

/// Sink receiving canonical records from the processor.
///
/// Implementations absorb downstream errors; the ingress path stays live.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn add(&self, record: LogRecord);
}

/// Write half of the store as seen by the insert buffer.
#[async_trait]
pub trait BatchInsert: Send + Sync {
    async fn insert_batch(&self, records: &[LogRecord]) -> anyhow::Result<()>;
}
