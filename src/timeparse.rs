//! Heuristic extraction of timestamps from textual and numeric payloads.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Extract a timestamp from a JSON value (string or number).
pub fn parse_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_text(s),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                parse_epoch(i)
            } else {
                n.as_f64().and_then(parse_epoch_float)
            }
        }
        _ => None,
    }
}

/// Parse a textual timestamp, trying RFC3339 first, then common layouts,
/// then a bare numeric epoch.
pub fn parse_text(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(n) = s.parse::<i64>() {
        return parse_epoch(n);
    }
    if let Ok(f) = s.parse::<f64>() {
        return parse_epoch_float(f);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // Zone-carrying layouts.
    const ZONED: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f %z",
        "%Y-%m-%d %H:%M:%S %z",
        "%d/%b/%Y:%H:%M:%S %z",
    ];
    for layout in ZONED {
        if let Ok(dt) = DateTime::parse_from_str(s, layout) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    // Naive layouts, assumed UTC.
    const NAIVE: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
    ];
    for layout in NAIVE {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }

    // Syslog style carries no year; borrow the current one.
    let with_year = format!("{} {s}", Utc::now().year());
    if let Ok(dt) = NaiveDateTime::parse_from_str(&with_year, "%Y %b %e %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&dt));
    }

    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
    }

    None
}

/// Classify an integer epoch by magnitude: seconds, milliseconds,
/// microseconds, or nanoseconds.
pub fn parse_epoch(n: i64) -> Option<DateTime<Utc>> {
    if n <= 0 {
        return None;
    }
    let (secs, nanos) = if n >= 1_000_000_000_000_000_000 {
        (n / 1_000_000_000, (n % 1_000_000_000) as u32)
    } else if n >= 1_000_000_000_000_000 {
        (n / 1_000_000, ((n % 1_000_000) * 1_000) as u32)
    } else if n >= 1_000_000_000_000 {
        (n / 1_000, ((n % 1_000) * 1_000_000) as u32)
    } else if n >= 100_000_000 {
        (n, 0)
    } else {
        return None;
    };
    DateTime::from_timestamp(secs, nanos)
}

fn parse_epoch_float(f: f64) -> Option<DateTime<Utc>> {
    if !f.is_finite() || f <= 0.0 {
        return None;
    }
    // Fractional epochs are always seconds.
    if f < 100_000_000.0 {
        return None;
    }
    if f.fract() == 0.0 {
        return parse_epoch(f as i64);
    }
    let secs = f.trunc() as i64;
    let nanos = (f.fract() * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rfc3339_with_offset() {
        let dt = parse_text("2026-03-01T10:20:30.5+02:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-03-01T08:20:30.500+00:00");
    }

    #[test]
    fn naive_layouts_assume_utc() {
        let dt = parse_text("2026-03-01 10:20:30").unwrap();
        assert_eq!(dt.timestamp(), 1772360430);
    }

    #[test]
    fn epoch_magnitudes() {
        let secs = parse_epoch(1_700_000_000).unwrap();
        let millis = parse_epoch(1_700_000_000_000).unwrap();
        let micros = parse_epoch(1_700_000_000_000_000).unwrap();
        let nanos = parse_epoch(1_700_000_000_000_000_000).unwrap();
        assert_eq!(secs, millis);
        assert_eq!(millis, micros);
        assert_eq!(micros, nanos);
    }

    #[test]
    fn small_and_negative_numbers_are_not_epochs() {
        assert!(parse_epoch(0).is_none());
        assert!(parse_epoch(-5).is_none());
        assert!(parse_epoch(12345).is_none());
    }

    #[test]
    fn json_values() {
        assert!(parse_value(&json!("2026-03-01T10:20:30Z")).is_some());
        assert!(parse_value(&json!(1_700_000_000_u64)).is_some());
        assert!(parse_value(&json!(1_700_000_000.25)).is_some());
        assert!(parse_value(&json!({"nested": true})).is_none());
        assert!(parse_value(&json!("not a time")).is_none());
    }

    #[test]
    fn numeric_strings_parse_as_epochs() {
        assert_eq!(parse_text("1700000000"), parse_epoch(1_700_000_000));
    }
}
