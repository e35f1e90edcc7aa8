//! Conversion of raw JSON payloads (OTEL and common log shapes) into
//! canonical records.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::model::LogRecord;
use crate::timeparse;

// ---------------------------------------------------------------------------
// Severity ladders
// ---------------------------------------------------------------------------

/// Normalize a textual severity to the canonical ladder.
pub fn normalize_level(text: &str) -> &'static str {
    match text.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "TRACE",
        "DEBUG" | "DBG" => "DEBUG",
        "INFO" | "INFORMATION" | "NOTICE" => "INFO",
        "WARN" | "WARNING" => "WARN",
        "ERROR" | "ERR" => "ERROR",
        "FATAL" => "FATAL",
        "CRITICAL" | "CRIT" => "CRITICAL",
        _ => "UNKNOWN",
    }
}

/// Map an OTEL severity number (1–24) to the text ladder.
pub fn severity_number_to_level(n: i64) -> &'static str {
    match n {
        1..=4 => "TRACE",
        5..=8 => "DEBUG",
        9..=12 => "INFO",
        13..=16 => "WARN",
        17..=20 => "ERROR",
        21..=24 => "FATAL",
        _ => "UNKNOWN",
    }
}

/// Map a Pino numeric level (10/20/30/40/50/60) to the text ladder.
pub fn pino_level(n: i64) -> &'static str {
    match n {
        10 => "TRACE",
        20 => "DEBUG",
        30 => "INFO",
        40 => "WARN",
        50 => "ERROR",
        60 => "FATAL",
        _ => "UNKNOWN",
    }
}

/// Default numeric severity for a canonical level (Pino ladder).
pub fn level_to_num(level: &str) -> i64 {
    match level {
        "TRACE" => 10,
        "DEBUG" => 20,
        "INFO" => 30,
        "WARN" => 40,
        "ERROR" => 50,
        "FATAL" | "CRITICAL" => 60,
        _ => 0,
    }
}

/// Scan a plain-text line for a severity token.
pub fn detect_text_level(line: &str) -> &'static str {
    let upper = line.to_ascii_uppercase();
    for (needle, level) in [
        ("FATAL", "FATAL"),
        ("CRITICAL", "CRITICAL"),
        ("ERROR", "ERROR"),
        ("WARN", "WARN"),
        ("DEBUG", "DEBUG"),
        ("TRACE", "TRACE"),
        ("INFO", "INFO"),
    ] {
        if upper.contains(needle) {
            return level;
        }
    }
    "UNKNOWN"
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Collapse tabs, newlines, and carriage returns into spaces.
pub fn clean_message(msg: &str) -> String {
    msg.chars()
        .map(|c| match c {
            '\n' | '\r' | '\t' => ' ',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Derive the service name from attributes, falling back to the app bucket
/// when it is non-default.
pub fn derive_service(attributes: &BTreeMap<String, String>, app: &str) -> String {
    for key in ["service.name", "service", "serviceName", "app", "name"] {
        if let Some(v) = attributes.get(key)
            && !v.is_empty()
        {
            return v.clone();
        }
    }
    if !app.is_empty() && app != "default" {
        return app.to_string();
    }
    "unknown".to_string()
}

pub fn derive_hostname(attributes: &BTreeMap<String, String>) -> String {
    for key in ["host", "hostname", "host.name"] {
        if let Some(v) = attributes.get(key)
            && !v.is_empty()
        {
            return v.clone();
        }
    }
    String::new()
}

pub fn derive_pid(attributes: &BTreeMap<String, String>) -> Option<i32> {
    attributes.get("pid").and_then(|v| v.parse().ok())
}

/// Render a JSON scalar as a bare string; compound values keep their JSON
/// encoding.
fn scalar_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render an OTEL AnyValue (`{"stringValue": ...}` etc.) as a string.
/// Plain scalars pass through so non-envelope bodies also work.
fn any_value_to_string(v: &Value) -> String {
    if let Some(obj) = v.as_object() {
        if let Some(s) = obj.get("stringValue").and_then(Value::as_str) {
            return s.to_string();
        }
        for key in ["intValue", "doubleValue", "boolValue"] {
            if let Some(inner) = obj.get(key) {
                return scalar_string(inner);
            }
        }
        if obj.contains_key("arrayValue") || obj.contains_key("kvlistValue") {
            return v.to_string();
        }
    }
    scalar_string(v)
}

/// Flatten an OTEL `[{key, value}]` list into the attribute map.
fn merge_kvlist(list: &[Value], out: &mut BTreeMap<String, String>) {
    for kv in list {
        let Some(key) = kv.get("key").and_then(Value::as_str) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        let value = kv.get("value").map(any_value_to_string).unwrap_or_default();
        out.insert(key.to_string(), value);
    }
}

// ---------------------------------------------------------------------------
// Extraction entry points
// ---------------------------------------------------------------------------

/// Extract canonical records from a parsed JSON payload.
///
/// Recognizes, in order: an OTEL export envelope, a single OTEL log record,
/// and common flat log shapes (`msg`/`message` plus friends). Returns an
/// empty vec for JSON that carries no recognizable log content.
pub fn extract_json(value: &Value, raw_line: &str) -> Vec<LogRecord> {
    if let Some(records) = extract_envelope(value, raw_line) {
        return records;
    }
    if let Some(obj) = value.as_object() {
        if is_otel_record(obj) {
            return otel_record(obj, &BTreeMap::new(), raw_line)
                .into_iter()
                .collect();
        }
        return generic_record(obj, raw_line).into_iter().collect();
    }
    Vec::new()
}

/// Build the fallback record for a plain text line (passthrough mode and
/// non-JSON single lines).
pub fn fallback_record(line: &str, raw_line: &str) -> LogRecord {
    let level = detect_text_level(line);
    LogRecord {
        timestamp: Utc::now(),
        orig_timestamp: None,
        level: level.to_string(),
        level_num: level_to_num(level),
        message: clean_message(line),
        raw_line: raw_line.to_string(),
        service: String::new(),
        hostname: String::new(),
        pid: None,
        attributes: BTreeMap::new(),
        source: String::new(),
        app: String::new(),
        event_id: String::new(),
    }
}

// ---------------------------------------------------------------------------
// OTEL shapes
// ---------------------------------------------------------------------------

fn extract_envelope(value: &Value, raw_line: &str) -> Option<Vec<LogRecord>> {
    let resource_logs = value.get("resourceLogs")?.as_array()?;
    let mut out = Vec::new();

    for rl in resource_logs {
        let mut resource_attrs = BTreeMap::new();
        if let Some(attrs) = rl
            .pointer("/resource/attributes")
            .and_then(Value::as_array)
        {
            merge_kvlist(attrs, &mut resource_attrs);
        }

        for sl in rl
            .get("scopeLogs")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let mut inherited = resource_attrs.clone();
            if let Some(scope) = sl.get("scope") {
                if let Some(name) = scope.get("name").and_then(Value::as_str)
                    && !name.is_empty()
                {
                    inherited.insert("otel.scope.name".to_string(), name.to_string());
                }
                if let Some(version) = scope.get("version").and_then(Value::as_str)
                    && !version.is_empty()
                {
                    inherited.insert("otel.scope.version".to_string(), version.to_string());
                }
            }

            for lr in sl
                .get("logRecords")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(obj) = lr.as_object()
                    && let Some(record) = otel_record(obj, &inherited, raw_line)
                {
                    out.push(record);
                }
            }
        }
    }

    Some(out)
}

fn is_otel_record(obj: &Map<String, Value>) -> bool {
    obj.contains_key("timeUnixNano")
        || obj.contains_key("observedTimeUnixNano")
        || obj.contains_key("severityText")
        || obj.contains_key("severityNumber")
        || obj
            .get("body")
            .and_then(Value::as_object)
            .is_some_and(|b| b.contains_key("stringValue"))
}

fn otel_record(
    obj: &Map<String, Value>,
    inherited: &BTreeMap<String, String>,
    raw_line: &str,
) -> Option<LogRecord> {
    let mut attributes = inherited.clone();
    if let Some(attrs) = obj.get("attributes").and_then(Value::as_array) {
        merge_kvlist(attrs, &mut attributes);
    }

    // OTLP JSON encodes severityNumber and the nano timestamps as either
    // numbers or decimal strings.
    let severity_number = obj.get("severityNumber").and_then(json_i64);
    let severity_text = obj
        .get("severityText")
        .and_then(Value::as_str)
        .unwrap_or("");
    let level = if severity_text.is_empty() {
        severity_number_to_level(severity_number.unwrap_or(0))
    } else {
        normalize_level(severity_text)
    };
    let level_num = severity_number.unwrap_or_else(|| level_to_num(level));

    let message = obj
        .get("body")
        .map(any_value_to_string)
        .unwrap_or_default();

    let orig_timestamp = obj
        .get("timeUnixNano")
        .and_then(timeparse::parse_value)
        .or_else(|| {
            obj.get("observedTimeUnixNano")
                .and_then(timeparse::parse_value)
        });

    for (field, key) in [("traceId", "trace_id"), ("spanId", "span_id")] {
        if let Some(v) = obj.get(field).and_then(Value::as_str)
            && !v.is_empty()
        {
            attributes.insert(key.to_string(), v.to_string());
        }
    }

    Some(LogRecord {
        timestamp: Utc::now(),
        orig_timestamp,
        level: level.to_string(),
        level_num,
        message: clean_message(&message),
        raw_line: raw_line.to_string(),
        service: String::new(),
        hostname: String::new(),
        pid: None,
        attributes,
        source: String::new(),
        app: String::new(),
        event_id: String::new(),
    })
}

fn json_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Common flat shapes (pino and friends)
// ---------------------------------------------------------------------------

const MESSAGE_KEYS: &[&str] = &["msg", "message", "body", "log", "text"];
const LEVEL_KEYS: &[&str] = &["level", "severity", "lvl"];
const TIME_KEYS: &[&str] = &["time", "timestamp", "ts", "@timestamp", "datetime"];

fn generic_record(obj: &Map<String, Value>, raw_line: &str) -> Option<LogRecord> {
    let message_val = MESSAGE_KEYS.iter().find_map(|k| obj.get(*k))?;
    let message = clean_message(&scalar_string(message_val));

    let (level, level_num) = match LEVEL_KEYS.iter().find_map(|k| obj.get(*k)) {
        Some(Value::String(s)) => {
            let level = normalize_level(s);
            (level, level_to_num(level))
        }
        Some(Value::Number(n)) => {
            let num = n.as_i64().unwrap_or(0);
            (pino_level(num), num)
        }
        _ => ("UNKNOWN", 0),
    };

    let orig_timestamp = TIME_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(timeparse::parse_value);

    let mut attributes = BTreeMap::new();
    for (key, value) in obj {
        let consumed = MESSAGE_KEYS.contains(&key.as_str())
            || LEVEL_KEYS.contains(&key.as_str())
            || TIME_KEYS.contains(&key.as_str());
        if !consumed {
            attributes.insert(key.clone(), scalar_string(value));
        }
    }

    Some(LogRecord {
        timestamp: Utc::now(),
        orig_timestamp,
        level: level.to_string(),
        level_num,
        message,
        raw_line: raw_line.to_string(),
        service: String::new(),
        hostname: String::new(),
        pid: None,
        attributes,
        source: String::new(),
        app: String::new(),
        event_id: String::new(),
    })
}
