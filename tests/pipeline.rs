//! Cross-component tests: processor → insert buffer → journal → store.

mod helpers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use logwell::buffer::{InsertBuffer, InsertBufferConfig};
use logwell::journal::Journal;
use logwell::model::{BatchInsert, Envelope, LogRecord, QueryOpts};
use logwell::processor::EnvelopeProcessor;
use logwell::store::{RetentionCleaner, Store, StoreConfig, StoreError};

use helpers::{memory_store, record, record_at};

// ---------------------------------------------------------------------------
// Store reads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn counts_and_bytes_respect_the_app_filter() {
    let store = memory_store().await;
    let mut records = vec![record("one"), record("two")];
    records[1].app = "billing".into();
    store.insert_log_batch(&records).await.unwrap();

    assert_eq!(store.total_log_count(&QueryOpts::default()).await.unwrap(), 2);
    assert_eq!(
        store
            .total_log_count(&QueryOpts::for_app("billing"))
            .await
            .unwrap(),
        1
    );
    let bytes = store.total_log_bytes(&QueryOpts::default()).await.unwrap();
    assert_eq!(bytes, "one".len() as i64 + "two".len() as i64);
}

#[tokio::test]
async fn empty_app_is_coerced_to_default_on_insert() {
    let store = memory_store().await;
    let mut r = record("no app");
    r.app = String::new();
    r.event_id = String::new();
    store.insert_log_batch(&[r]).await.unwrap();

    let apps = store.list_apps().await.unwrap();
    assert_eq!(apps, vec!["default".to_string()]);

    let rows = store.recent_logs_filtered(10, None, &[], None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].app, "default");
    assert!(!rows[0].event_id.is_empty(), "event id assigned at insert");
}

#[tokio::test]
async fn aggregations_over_a_mixed_batch() {
    let store = memory_store().await;

    let mut records = Vec::new();
    for i in 0..3 {
        let mut r = record(&format!("request failed badly {i}"));
        r.level = "ERROR".into();
        r.service = "api".into();
        r.attributes
            .insert("region".to_string(), format!("zone-{}", i % 2));
        records.push(r);
    }
    let mut ok = record("request served fine");
    ok.service = "web".into();
    ok.hostname = "host-2".into();
    records.push(ok);
    store.insert_log_batch(&records).await.unwrap();

    let words = store.top_words(5, &QueryOpts::default()).await.unwrap();
    assert_eq!(words[0].word, "request");
    assert_eq!(words[0].count, 4);

    let severities = store.severity_counts(&QueryOpts::default()).await.unwrap();
    let errors = severities.iter().find(|d| d.value == "ERROR").unwrap();
    assert_eq!(errors.count, 3);

    let services = store.top_services(5, &QueryOpts::default()).await.unwrap();
    assert_eq!(services[0].value, "api");
    assert_eq!(services[0].count, 3);

    let by_severity = store
        .top_services_by_severity("error", 5, &QueryOpts::default())
        .await
        .unwrap();
    assert_eq!(by_severity.len(), 1);
    assert_eq!(by_severity[0].value, "api");

    let hosts = store.top_hosts(5, &QueryOpts::default()).await.unwrap();
    assert_eq!(hosts[0].value, "host-1");

    let attrs = store.top_attributes(5, &QueryOpts::default()).await.unwrap();
    assert!(attrs.iter().any(|a| a.key == "region" && a.value == "zone-0"));

    let keys = store
        .top_attribute_keys(5, &QueryOpts::default())
        .await
        .unwrap();
    let region = keys.iter().find(|k| k.key == "region").unwrap();
    assert_eq!(region.unique_values, 2);
    assert_eq!(region.total_count, 3);

    let values = store.attribute_key_values("region", 5).await.unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].value, "zone-0");

    let tables = store.table_row_counts().await.unwrap();
    assert_eq!(tables["logs"], 4);

    let minutes = store
        .severity_counts_by_minute(None, &QueryOpts::default())
        .await
        .unwrap();
    let total: i64 = minutes.iter().map(|m| m.total).sum();
    let errors: i64 = minutes.iter().map(|m| m.error).sum();
    assert_eq!(total, 4);
    assert_eq!(errors, 3);
}

#[tokio::test]
async fn recent_logs_filter_by_severity_and_regex_in_ascending_order() {
    let store = memory_store().await;
    let base = Utc::now() - chrono::Duration::minutes(10);

    let mut records = Vec::new();
    for i in 0..20 {
        let mut r = record_at(
            &format!("request {i} completed"),
            base + chrono::Duration::seconds(i),
        );
        if i % 2 == 0 {
            r.level = "ERROR".into();
            r.message = format!("request {i} failed: timeout");
        }
        records.push(r);
    }
    store.insert_log_batch(&records).await.unwrap();

    let rows = store
        .recent_logs_filtered(3, None, &["error".to_string()], Some(r"timeout$"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    // Newest three matches, reordered ascending.
    assert_eq!(rows[0].message, "request 14 failed: timeout");
    assert_eq!(rows[1].message, "request 16 failed: timeout");
    assert_eq!(rows[2].message, "request 18 failed: timeout");

    let invalid = store
        .recent_logs_filtered(3, None, &[], Some("("))
        .await;
    assert!(matches!(invalid, Err(StoreError::Rejected(_))));
}

#[tokio::test]
async fn attributes_survive_the_round_trip_as_a_string_map() {
    let store = memory_store().await;
    let mut r = record("attributed");
    r.attributes = BTreeMap::from([
        ("service.name".to_string(), "api".to_string()),
        ("retry".to_string(), "3".to_string()),
    ]);
    store.insert_log_batch(&[r.clone()]).await.unwrap();

    let rows = store.recent_logs_filtered(1, None, &[], None).await.unwrap();
    assert_eq!(rows[0].attributes, r.attributes);
}

// ---------------------------------------------------------------------------
// Safe ad-hoc query
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_query_gates_and_returns_rows() {
    let store = memory_store().await;
    store
        .insert_log_batch(&[record("alpha"), record("beta")])
        .await
        .unwrap();

    // Keyword hidden in a comment is still rejected.
    let rejected = store
        .execute_query("SELECT /* DROP */ COUNT(*) FROM logs")
        .await;
    assert!(matches!(rejected, Err(StoreError::Rejected(_))));

    let rows = store
        .execute_query("SELECT COUNT(*) AS n FROM logs")
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["n"], serde_json::json!(2));

    let rows = store
        .execute_query("SELECT message FROM logs ORDER BY message")
        .await
        .unwrap();
    assert_eq!(rows[0]["message"], serde_json::json!("alpha"));
    assert_eq!(rows[1]["message"], serde_json::json!("beta"));
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_round_trips_through_a_fresh_store() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreConfig {
        db_path: Some(dir.path().join("logs.db")),
        ..Default::default()
    })
    .await
    .unwrap();

    let records: Vec<LogRecord> = (0..10).map(|i| record(&format!("r{i}"))).collect();
    store.insert_log_batch(&records).await.unwrap();

    let snapshot_path = dir.path().join("snapshots/logs.db");
    store.snapshot_to(&snapshot_path).await.unwrap();
    store.close().await;

    let restored = Store::open(StoreConfig {
        db_path: Some(snapshot_path),
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(
        restored
            .total_log_count(&QueryOpts::default())
            .await
            .unwrap(),
        10
    );
}

#[tokio::test]
async fn snapshot_of_an_in_memory_store_is_an_error() {
    let store = memory_store().await;
    let dir = TempDir::new().unwrap();
    let result = store.snapshot_to(dir.path().join("never.db")).await;
    assert!(matches!(result, Err(StoreError::InMemoryStore)));
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retention_catch_up_pass_removes_expired_rows() {
    let store = Arc::new(memory_store().await);
    let old = record_at("ancient", Utc::now() - chrono::Duration::days(30));
    let fresh = record("fresh");
    store.insert_log_batch(&[old, fresh]).await.unwrap();

    let cleaner = RetentionCleaner::spawn(store.clone(), 7).expect("cleaner enabled");
    // The catch-up pass runs at spawn; give it a moment.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cleaner.stop().await;
    cleaner.stop().await;

    let rows = store.recent_logs_filtered(10, None, &[], None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].message, "fresh");
}

#[tokio::test]
async fn retention_is_disabled_for_non_positive_horizons() {
    let store = Arc::new(memory_store().await);
    assert!(RetentionCleaner::spawn(store.clone(), 0).is_none());
    assert!(RetentionCleaner::spawn(store, -3).is_none());
}

// ---------------------------------------------------------------------------
// Processor → buffer → store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn otel_envelope_flows_end_to_end() {
    let store = Arc::new(memory_store().await);
    let buffer = Arc::new(InsertBuffer::new(
        store.clone(),
        InsertBufferConfig {
            batch_size: 10,
            flush_interval: Duration::from_millis(10),
            ..Default::default()
        },
    ));
    let processor =
        EnvelopeProcessor::new("parse", "stdin", "default", buffer.clone()).unwrap();

    let line = serde_json::json!({
        "resourceLogs": [{
            "resource": {"attributes": [
                {"key": "service.name", "value": {"stringValue": "api"}}
            ]},
            "scopeLogs": [{
                "logRecords": [
                    {"severityText": "Info", "body": {"stringValue": "log one"}},
                    {"severityText": "Warn", "body": {"stringValue": "log two"}}
                ]
            }]
        }]
    })
    .to_string();

    let result = processor
        .process_envelope(Envelope {
            source: "tcp".into(),
            line,
        })
        .await;
    assert!(result.is_some());
    buffer.stop().await;

    let rows = store.recent_logs_filtered(10, None, &[], None).await.unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.service, "api");
        assert_eq!(row.source, "tcp");
        assert_eq!(row.app, "default");
        assert!(!row.event_id.is_empty());
    }
    let levels: Vec<&str> = rows.iter().map(|r| r.level.as_str()).collect();
    assert!(levels.contains(&"INFO") && levels.contains(&"WARN"));
}

/// Store wrapper that slows every batch down, for backpressure tests.
struct SlowStore {
    inner: Arc<Store>,
    delay: Duration,
}

#[async_trait]
impl BatchInsert for SlowStore {
    async fn insert_batch(&self, records: &[LogRecord]) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_log_batch(records).await?;
        Ok(())
    }
}

#[tokio::test]
async fn backpressure_falls_back_to_inline_flushes_without_loss() {
    let store = Arc::new(memory_store().await);
    let slow = Arc::new(SlowStore {
        inner: store.clone(),
        delay: Duration::from_millis(300),
    });
    let buffer = Arc::new(InsertBuffer::new(
        slow,
        InsertBufferConfig {
            batch_size: 1,
            flush_interval: Duration::from_secs(60),
            flush_queue_size: 1,
            journal: None,
        },
    ));

    for i in 0..4 {
        buffer.add(record(&format!("burst {i}"))).await;
    }
    buffer.stop().await;

    assert!(buffer.inline_flush_count() >= 1, "expected an inline flush");
    assert_eq!(store.total_log_count(&QueryOpts::default()).await.unwrap(), 4);
}

// ---------------------------------------------------------------------------
// Journal recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn uncommitted_journal_entries_are_recovered_into_the_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("wal.jsonl");

    // A previous process journaled three records but only committed one
    // before stopping.
    {
        let journal = Journal::open(&path).unwrap();
        for i in 1..=3 {
            journal.append(&record(&format!("r{i}"))).unwrap();
        }
        journal.commit(1).unwrap();
        journal.close().unwrap();
    }

    // Startup: replay the uncommitted suffix into the store and commit.
    let store = memory_store().await;
    let journal = Journal::open(&path).unwrap();
    let mut recovered = Vec::new();
    let mut max_seq = 0;
    journal
        .replay(|seq, rec| {
            max_seq = seq;
            recovered.push(rec);
            Ok(())
        })
        .unwrap();
    store.insert_log_batch(&recovered).await.unwrap();
    journal.commit(max_seq).unwrap();

    let rows = store.recent_logs_filtered(10, None, &[], None).await.unwrap();
    let messages: Vec<&str> = rows.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(messages, ["r2", "r3"]);
    assert_eq!(journal.committed(), 3);
}
