//! Ordered, idempotent, transactional schema migrations.
//!
//! SQL files are embedded at compile time and applied in numeric order.
//! Each migration runs in its own transaction and records its version in
//! `schema_migrations`, so `run` is safe to call on every startup.

use std::collections::HashSet;

use chrono::Utc;
use sqlx::sqlite::SqlitePool;

use super::StoreError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init",
        sql: include_str!("../../migrations/0001_init.sql"),
    },
    Migration {
        version: 2,
        name: "indexes",
        sql: include_str!("../../migrations/0002_indexes.sql"),
    },
];

async fn ensure_version_table(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn applied_versions(pool: &SqlitePool) -> Result<HashSet<i64>, StoreError> {
    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    Ok(versions.into_iter().collect())
}

/// Apply every pending migration in order.
pub(crate) async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    ensure_version_table(pool).await?;
    let applied = applied_versions(pool).await?;

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applied migration"
        );
    }
    Ok(())
}

/// Report `(current_version, pending_count)`.
pub(crate) async fn status(pool: &SqlitePool) -> Result<(i64, usize), StoreError> {
    ensure_version_table(pool).await?;
    let applied = applied_versions(pool).await?;
    let current = applied.iter().copied().max().unwrap_or(0);
    let pending = MIGRATIONS
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .count();
    Ok((current, pending))
}
