//! Read path: aggregations and filtered recent logs.
//!
//! Every method takes the shared lock, an optional global read slot, and
//! runs under the store's query deadline.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row};

use crate::model::{
    AttributeKeyStat, AttributeStat, DimensionCount, LogRecord, MinuteCounts, QueryOpts, WordCount,
};

use super::{Store, StoreError};

/// Tables exposed through `table_row_counts`.
const COUNTED_TABLES: &[&str] = &["logs"];

/// Default window for the per-minute severity breakdown.
const DEFAULT_MINUTE_WINDOW: Duration = Duration::from_secs(3600);

/// Page size for the descending scan behind `recent_logs_filtered`.
const RECENT_SCAN_PAGE: i64 = 1000;

impl Store {
    pub async fn total_log_count(&self, opts: &QueryOpts) -> Result<i64, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let count = sqlx::query_scalar("SELECT COUNT(*) FROM logs WHERE (?1 IS NULL OR app = ?1)")
                .bind(opts.app.as_deref())
                .fetch_one(self.pool())
                .await?;
            Ok(count)
        })
        .await
    }

    pub async fn total_log_bytes(&self, opts: &QueryOpts) -> Result<i64, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let bytes = sqlx::query_scalar(
                "SELECT COALESCE(SUM(LENGTH(raw_line)), 0) FROM logs WHERE (?1 IS NULL OR app = ?1)",
            )
            .bind(opts.app.as_deref())
            .fetch_one(self.pool())
            .await?;
            Ok(bytes)
        })
        .await
    }

    /// Most frequent message words: lowercased, split on spaces, trimmed of
    /// non-alphanumeric edges, length 3–50.
    pub async fn top_words(&self, limit: i64, opts: &QueryOpts) -> Result<Vec<WordCount>, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let messages: Vec<String> =
                sqlx::query_scalar("SELECT message FROM logs WHERE (?1 IS NULL OR app = ?1)")
                    .bind(opts.app.as_deref())
                    .fetch_all(self.pool())
                    .await?;
            Ok(rank_words(&messages, limit))
        })
        .await
    }

    pub async fn top_attributes(
        &self,
        limit: i64,
        opts: &QueryOpts,
    ) -> Result<Vec<AttributeStat>, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let rows = sqlx::query(
                r"
                SELECT j.key AS key, j.value AS value, COUNT(*) AS count
                FROM logs, json_each(logs.attributes) AS j
                WHERE (?1 IS NULL OR app = ?1)
                GROUP BY j.key, j.value
                ORDER BY count DESC, j.key ASC, j.value ASC
                LIMIT ?2
                ",
            )
            .bind(opts.app.as_deref())
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
            rows.iter()
                .map(|row| {
                    Ok(AttributeStat {
                        key: row.try_get("key")?,
                        value: row.try_get("value")?,
                        count: row.try_get("count")?,
                    })
                })
                .collect()
        })
        .await
    }

    /// Attribute keys ranked by unique-value count, descending.
    pub async fn top_attribute_keys(
        &self,
        limit: i64,
        opts: &QueryOpts,
    ) -> Result<Vec<AttributeKeyStat>, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let rows = sqlx::query(
                r"
                SELECT j.key AS key,
                       COUNT(DISTINCT j.value) AS unique_values,
                       COUNT(*) AS total_count
                FROM logs, json_each(logs.attributes) AS j
                WHERE (?1 IS NULL OR app = ?1)
                GROUP BY j.key
                ORDER BY unique_values DESC, j.key ASC
                LIMIT ?2
                ",
            )
            .bind(opts.app.as_deref())
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
            rows.iter()
                .map(|row| {
                    Ok(AttributeKeyStat {
                        key: row.try_get("key")?,
                        unique_values: row.try_get("unique_values")?,
                        total_count: row.try_get("total_count")?,
                    })
                })
                .collect()
        })
        .await
    }

    pub async fn attribute_key_values(
        &self,
        key: &str,
        limit: i64,
    ) -> Result<Vec<DimensionCount>, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let rows = sqlx::query(
                r"
                SELECT j.value AS value, COUNT(*) AS count
                FROM logs, json_each(logs.attributes) AS j
                WHERE j.key = ?1
                GROUP BY j.value
                ORDER BY count DESC, j.value ASC
                LIMIT ?2
                ",
            )
            .bind(key)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
            collect_dimension_counts(&rows)
        })
        .await
    }

    pub async fn severity_counts(&self, opts: &QueryOpts) -> Result<Vec<DimensionCount>, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let rows = sqlx::query(
                r"
                SELECT level AS value, COUNT(*) AS count
                FROM logs
                WHERE (?1 IS NULL OR app = ?1)
                GROUP BY level
                ORDER BY count DESC, level ASC
                ",
            )
            .bind(opts.app.as_deref())
            .fetch_all(self.pool())
            .await?;
            collect_dimension_counts(&rows)
        })
        .await
    }

    /// Per-minute severity breakdown over the trailing window
    /// (default 60 minutes).
    pub async fn severity_counts_by_minute(
        &self,
        window: Option<Duration>,
        opts: &QueryOpts,
    ) -> Result<Vec<MinuteCounts>, StoreError> {
        let window = window.unwrap_or(DEFAULT_MINUTE_WINDOW);
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1));
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let rows = sqlx::query(
                r"
                SELECT strftime('%Y-%m-%dT%H:%M', timestamp) AS minute,
                       SUM(CASE WHEN level = 'TRACE' THEN 1 ELSE 0 END) AS trace,
                       SUM(CASE WHEN level = 'DEBUG' THEN 1 ELSE 0 END) AS debug,
                       SUM(CASE WHEN level = 'INFO' THEN 1 ELSE 0 END) AS info,
                       SUM(CASE WHEN level = 'WARN' THEN 1 ELSE 0 END) AS warn,
                       SUM(CASE WHEN level = 'ERROR' THEN 1 ELSE 0 END) AS error,
                       SUM(CASE WHEN level IN ('FATAL', 'CRITICAL') THEN 1 ELSE 0 END) AS fatal,
                       COUNT(*) AS total
                FROM logs
                WHERE timestamp >= ?1 AND (?2 IS NULL OR app = ?2)
                GROUP BY minute
                ORDER BY minute ASC
                ",
            )
            .bind(cutoff)
            .bind(opts.app.as_deref())
            .fetch_all(self.pool())
            .await?;
            rows.iter()
                .map(|row| {
                    Ok(MinuteCounts {
                        minute: row.try_get("minute")?,
                        trace: row.try_get("trace")?,
                        debug: row.try_get("debug")?,
                        info: row.try_get("info")?,
                        warn: row.try_get("warn")?,
                        error: row.try_get("error")?,
                        fatal: row.try_get("fatal")?,
                        total: row.try_get("total")?,
                    })
                })
                .collect()
        })
        .await
    }

    pub async fn top_hosts(&self, limit: i64, opts: &QueryOpts) -> Result<Vec<DimensionCount>, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let rows = sqlx::query(
                r"
                SELECT hostname AS value, COUNT(*) AS count
                FROM logs
                WHERE hostname <> '' AND (?1 IS NULL OR app = ?1)
                GROUP BY hostname
                ORDER BY count DESC, hostname ASC
                LIMIT ?2
                ",
            )
            .bind(opts.app.as_deref())
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
            collect_dimension_counts(&rows)
        })
        .await
    }

    pub async fn top_services(
        &self,
        limit: i64,
        opts: &QueryOpts,
    ) -> Result<Vec<DimensionCount>, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let rows = sqlx::query(
                r"
                SELECT service AS value, COUNT(*) AS count
                FROM logs
                WHERE (?1 IS NULL OR app = ?1)
                GROUP BY service
                ORDER BY count DESC, service ASC
                LIMIT ?2
                ",
            )
            .bind(opts.app.as_deref())
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
            collect_dimension_counts(&rows)
        })
        .await
    }

    /// Services ranked by row count at one severity; ties break
    /// alphabetically.
    pub async fn top_services_by_severity(
        &self,
        severity: &str,
        limit: i64,
        opts: &QueryOpts,
    ) -> Result<Vec<DimensionCount>, StoreError> {
        let severity = severity.to_ascii_uppercase();
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let rows = sqlx::query(
                r"
                SELECT service AS value, COUNT(*) AS count
                FROM logs
                WHERE level = ?1 AND (?2 IS NULL OR app = ?2)
                GROUP BY service
                ORDER BY count DESC, service ASC
                LIMIT ?3
                ",
            )
            .bind(&severity)
            .bind(opts.app.as_deref())
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
            collect_dimension_counts(&rows)
        })
        .await
    }

    pub async fn list_apps(&self) -> Result<Vec<String>, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let apps = sqlx::query_scalar("SELECT DISTINCT app FROM logs ORDER BY app ASC")
                .fetch_all(self.pool())
                .await?;
            Ok(apps)
        })
        .await
    }

    /// The most recent `limit` rows matching all filters, returned in
    /// ascending chronological order.
    ///
    /// The message pattern is a regex applied while scanning descending
    /// pages, so the result is the newest `limit` matches even when the
    /// pattern is sparse.
    pub async fn recent_logs_filtered(
        &self,
        limit: i64,
        app: Option<&str>,
        severity_levels: &[String],
        message_pattern: Option<&str>,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let limit = limit.max(0);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let pattern = match message_pattern {
            Some(p) if !p.is_empty() => Some(
                Regex::new(p)
                    .map_err(|e| StoreError::Rejected(format!("invalid message pattern: {e}")))?,
            ),
            _ => None,
        };
        let levels: Vec<String> = severity_levels
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_ascii_uppercase())
            .collect();

        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let mut out: Vec<LogRecord> = Vec::new();
            let page = RECENT_SCAN_PAGE.max(limit);
            let mut offset = 0i64;

            loop {
                let mut qb = QueryBuilder::<sqlx::Sqlite>::new(
                    "SELECT timestamp, orig_timestamp, level, level_num, message, raw_line, \
                     service, hostname, pid, attributes, source, app, event_id \
                     FROM logs WHERE 1 = 1",
                );
                if let Some(app) = app
                    && !app.is_empty()
                {
                    qb.push(" AND app = ").push_bind(app);
                }
                if !levels.is_empty() {
                    qb.push(" AND level IN (");
                    let mut separated = qb.separated(", ");
                    for level in &levels {
                        separated.push_bind(level);
                    }
                    qb.push(")");
                }
                qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ")
                    .push_bind(page)
                    .push(" OFFSET ")
                    .push_bind(offset);

                let rows = qb.build().fetch_all(self.pool()).await?;
                let exhausted = (rows.len() as i64) < page;

                for row in &rows {
                    let record = record_from_row(row)?;
                    if pattern
                        .as_ref()
                        .is_none_or(|re| re.is_match(&record.message))
                    {
                        out.push(record);
                        if out.len() as i64 == limit {
                            break;
                        }
                    }
                }

                if out.len() as i64 == limit || exhausted || pattern.is_none() {
                    break;
                }
                offset += page;
            }

            out.reverse();
            Ok(out)
        })
        .await
    }

    /// Row counts for the allowlisted tables.
    pub async fn table_row_counts(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let mut out = BTreeMap::new();
            for table in COUNTED_TABLES {
                let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                    .fetch_one(self.pool())
                    .await?;
                out.insert((*table).to_string(), count);
            }
            Ok(out)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn collect_dimension_counts(rows: &[SqliteRow]) -> Result<Vec<DimensionCount>, StoreError> {
    rows.iter()
        .map(|row| {
            Ok(DimensionCount {
                value: row.try_get("value")?,
                count: row.try_get("count")?,
            })
        })
        .collect()
}

fn record_from_row(row: &SqliteRow) -> Result<LogRecord, StoreError> {
    let attributes: Option<String> = row.try_get("attributes")?;
    Ok(LogRecord {
        timestamp: row.try_get("timestamp")?,
        orig_timestamp: row.try_get("orig_timestamp")?,
        level: row.try_get("level")?,
        level_num: row.try_get::<Option<i64>, _>("level_num")?.unwrap_or(0),
        message: row.try_get("message")?,
        raw_line: row
            .try_get::<Option<String>, _>("raw_line")?
            .unwrap_or_default(),
        service: row
            .try_get::<Option<String>, _>("service")?
            .unwrap_or_default(),
        hostname: row
            .try_get::<Option<String>, _>("hostname")?
            .unwrap_or_default(),
        pid: row.try_get("pid")?,
        attributes: parse_attributes(attributes.as_deref()),
        source: row
            .try_get::<Option<String>, _>("source")?
            .unwrap_or_default(),
        app: row.try_get::<Option<String>, _>("app")?.unwrap_or_default(),
        event_id: row
            .try_get::<Option<String>, _>("event_id")?
            .unwrap_or_default(),
    })
}

/// Best-effort parse of the stored attributes JSON into a string map.
fn parse_attributes(text: Option<&str>) -> BTreeMap<String, String> {
    let Some(text) = text else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(text) {
        Ok(map) => map
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect(),
        Err(_) => BTreeMap::new(),
    }
}

/// Tokenize and rank message words.
fn rank_words(messages: &[String], limit: i64) -> Vec<WordCount> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for message in messages {
        for token in message.to_lowercase().split(' ') {
            let word = token.trim_matches(|c: char| !c.is_alphanumeric());
            if (3..=50).contains(&word.len()) {
                *counts.entry(word.to_string()).or_default() += 1;
            }
        }
    }
    let mut ranked: Vec<WordCount> = counts
        .into_iter()
        .map(|(word, count)| WordCount { word, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
    ranked.truncate(limit.max(0) as usize);
    ranked
}
