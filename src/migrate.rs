use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file and schema, then close the pool.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema setup. Safe to run on every startup.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Records are append-only: revisions insert a new row and point the old
    // one at it through `superseded_by`.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            source TEXT NOT NULL,
            source_native_id TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 0,
            content_hash TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            ingested_at INTEGER NOT NULL,
            superseded_by TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Duplicate keys: at most one active record per native id and per
    // content fingerprint.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_records_active_native \
         ON records(source_native_id) WHERE superseded_by IS NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_records_active_hash \
         ON records(content_hash) WHERE superseded_by IS NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_source ON records(source)")
        .execute(pool)
        .await?;

    // Model and dimensionality the stored vectors were produced with
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
