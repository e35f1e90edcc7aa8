#![allow(dead_code)]

use chrono::{DateTime, Utc};
use logwell::model::LogRecord;
use logwell::store::{Store, StoreConfig};

pub async fn memory_store() -> Store {
    Store::open(StoreConfig::default())
        .await
        .expect("open in-memory store")
}

pub fn record(message: &str) -> LogRecord {
    record_at(message, Utc::now())
}

pub fn record_at(message: &str, timestamp: DateTime<Utc>) -> LogRecord {
    LogRecord {
        timestamp,
        orig_timestamp: None,
        level: "INFO".into(),
        level_num: 30,
        message: message.into(),
        raw_line: message.into(),
        service: "api".into(),
        hostname: "host-1".into(),
        pid: None,
        attributes: Default::default(),
        source: "tcp".into(),
        app: "default".into(),
        event_id: String::new(),
    }
}
