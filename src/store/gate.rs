//! Safe ad-hoc query gate: defense-in-depth shape checks before a raw
//! SELECT is handed to the engine.

use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo};

use super::{Store, StoreError};

/// Statement keywords rejected anywhere in the query as whole words,
/// comment content included.
const DENYLIST: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "COPY", "ATTACH", "LOAD",
    "EXPORT", "IMPORT", "INSTALL", "CALL", "EXECUTE", "PRAGMA", "SET",
];

/// Result rows are capped at this many.
const MAX_RESULT_ROWS: usize = 1000;

impl Store {
    /// Execute an ad-hoc read-only query.
    ///
    /// The gate rejects semicolons, requires a SELECT/WITH prefix after
    /// comment stripping, and denies statement keywords as whole words.
    /// The original text is executed under the query deadline; results are
    /// capped at 1000 rows.
    pub async fn execute_query(
        &self,
        query: &str,
    ) -> Result<Vec<Map<String, Value>>, StoreError> {
        validate_query(query)?;

        let _slot = self.read_slot().await?;
        let _read = self.read_guard().await;
        self.bounded(async {
            let rows = sqlx::query(query).fetch_all(self.pool()).await?;
            Ok(rows.iter().take(MAX_RESULT_ROWS).map(row_to_json).collect())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub(crate) fn validate_query(query: &str) -> Result<(), StoreError> {
    if query.contains(';') {
        return Err(StoreError::Rejected("semicolons are not allowed".into()));
    }

    // The prefix check runs on the stripped text so leading comments cannot
    // hide the statement kind.
    let stripped = strip_comments(query).to_uppercase();
    match words(&stripped).next() {
        Some("SELECT") | Some("WITH") => {}
        _ => {
            return Err(StoreError::Rejected(
                "only SELECT or WITH queries are allowed".into(),
            ));
        }
    }

    // The denylist scans the original text: stripping inserts whitespace and
    // never mints new words, so this covers the post-strip text and the
    // comment bodies in one pass.
    let upper = query.to_uppercase();
    for word in words(&upper) {
        if DENYLIST.contains(&word) {
            return Err(StoreError::Rejected(format!(
                "keyword {word} is not allowed"
            )));
        }
    }
    Ok(())
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
}

/// Remove `/* ... */` and `-- ...` comments. An unterminated block comment
/// drops the remainder of the text.
pub(crate) fn strip_comments(query: &str) -> String {
    strip_line_comments(&strip_block_comments(query))
}

fn strip_block_comments(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut rest = query;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        out.push(' ');
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn strip_line_comments(query: &str) -> String {
    query
        .lines()
        .map(|line| line.split_once("--").map_or(line, |(head, _)| head))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Result mapping
// ---------------------------------------------------------------------------

/// Render one result row as a column → JSON value map.
fn row_to_json(row: &SqliteRow) -> Map<String, Value> {
    let mut out = Map::new();
    for column in row.columns() {
        let i = column.ordinal();
        let value = match column.type_info().name() {
            "TEXT" => text_value(row, i),
            "INTEGER" => int_value(row, i),
            "REAL" => float_value(row, i),
            "BLOB" => blob_value(row, i),
            // Expression columns report no declared type; probe in order.
            _ => int_value(row, i)
                .or_else(|| float_value(row, i))
                .or_else(|| text_value(row, i)),
        };
        out.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    out
}

fn text_value(row: &SqliteRow, i: usize) -> Option<Value> {
    row.try_get::<Option<String>, _>(i)
        .ok()
        .flatten()
        .map(Value::String)
}

fn int_value(row: &SqliteRow, i: usize) -> Option<Value> {
    row.try_get::<Option<i64>, _>(i)
        .ok()
        .flatten()
        .map(Value::from)
}

fn float_value(row: &SqliteRow, i: usize) -> Option<Value> {
    row.try_get::<Option<f64>, _>(i)
        .ok()
        .flatten()
        .map(Value::from)
}

fn blob_value(row: &SqliteRow, i: usize) -> Option<Value> {
    row.try_get::<Option<Vec<u8>>, _>(i)
        .ok()
        .flatten()
        .map(|bytes| Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rejected(query: &str) -> bool {
        matches!(validate_query(query), Err(StoreError::Rejected(_)))
    }

    #[test]
    fn plain_selects_pass() {
        assert!(validate_query("SELECT COUNT(*) FROM logs").is_ok());
        assert!(validate_query("select level, count(*) from logs group by level").is_ok());
        assert!(validate_query("WITH recent AS (SELECT * FROM logs) SELECT * FROM recent").is_ok());
    }

    #[test]
    fn semicolons_are_rejected() {
        assert!(rejected("SELECT 1; DROP TABLE logs"));
        assert!(rejected("SELECT 1;"));
    }

    #[test]
    fn non_select_prefixes_are_rejected() {
        assert!(rejected("DELETE FROM logs"));
        assert!(rejected("  vacuum"));
        assert!(rejected(""));
    }

    #[test]
    fn leading_comments_do_not_hide_the_statement_kind() {
        assert!(validate_query("/* note */ SELECT 1 FROM logs").is_ok());
        assert!(rejected("/* note */ VACUUM"));
    }

    #[test]
    fn keywords_inside_comments_are_rejected() {
        assert!(rejected("SELECT /* DROP */ COUNT(*) FROM logs"));
        assert!(rejected("SELECT COUNT(*) FROM logs -- then DELETE everything"));
    }

    #[test]
    fn denylist_matches_whole_words_only() {
        for kw in DENYLIST {
            assert!(
                rejected(&format!("SELECT 1 WHERE {kw} x")),
                "{kw} should reject"
            );
        }
        // Substrings and underscore-joined identifiers do not match.
        assert!(validate_query("SELECT updated_at FROM logs").is_ok());
        assert!(validate_query("SELECT * FROM logs LIMIT 5 OFFSET 2").is_ok());
        assert!(validate_query("SELECT inserted, created FROM logs").is_ok());
        assert!(validate_query("SELECT * FROM pragma_settings_view").is_ok());
    }

    #[test]
    fn comment_stripping() {
        let block = strip_comments("a /* b */ c");
        assert_eq!(words(&block).collect::<Vec<_>>(), ["a", "c"]);

        let line = strip_comments("a -- rest\nb");
        assert_eq!(words(&line).collect::<Vec<_>>(), ["a", "b"]);

        // Unterminated block comment drops the remainder.
        let open = strip_comments("a /* open drop");
        assert_eq!(words(&open).collect::<Vec<_>>(), ["a"]);
    }

    proptest! {
        #[test]
        fn any_denylisted_keyword_embedded_as_a_word_rejects(
            kw_idx in 0..super::DENYLIST.len(),
            prefix in "[a-z ]{0,20}",
            suffix in "[a-z ]{0,20}",
        ) {
            let kw = super::DENYLIST[kw_idx];
            let query = format!("SELECT {prefix} {kw} {suffix} FROM logs");
            prop_assert!(matches!(
                validate_query(&query),
                Err(StoreError::Rejected(_))
            ));
        }

        #[test]
        fn clean_selects_over_identifiers_pass(ident in "[a-z][a-z0-9_]{0,12}") {
            prop_assume!(!super::DENYLIST.contains(&ident.to_uppercase().as_str()));
            let query = format!("SELECT {ident} FROM logs");
            prop_assert!(validate_query(&query).is_ok());
        }
    }
}
