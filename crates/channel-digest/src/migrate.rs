use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema in the configured database. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Ingested messages; claim markers live on the row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel TEXT NOT NULL,
            source_message_id INTEGER NOT NULL,
            source_date INTEGER NOT NULL,
            text TEXT NOT NULL,
            entities_json TEXT,
            media_json TEXT,
            forwarded_from TEXT,
            canonical_hash TEXT NOT NULL,
            processed_at INTEGER,
            processing_started_at INTEGER,
            discoveries_extracted INTEGER NOT NULL DEFAULT 0,
            UNIQUE(channel, source_message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One item per raw message
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            raw_message_id INTEGER NOT NULL UNIQUE,
            relevance_score REAL NOT NULL DEFAULT 0,
            importance_score REAL NOT NULL DEFAULT 0,
            topic TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT '',
            language TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at INTEGER,
            first_seen_at INTEGER NOT NULL,
            digested_at INTEGER,
            error TEXT,
            duplicate_of_item_id INTEGER,
            FOREIGN KEY (raw_message_id) REFERENCES raw_messages(id),
            FOREIGN KEY (duplicate_of_item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_embeddings (
            item_id INTEGER PRIMARY KEY,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clusters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            topic TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_members (
            cluster_id INTEGER NOT NULL,
            item_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (cluster_id, item_id),
            FOREIGN KEY (cluster_id) REFERENCES clusters(id) ON DELETE CASCADE,
            FOREIGN KEY (item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per window; posted rows are never overwritten
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS digests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            chat_id TEXT NOT NULL,
            message_id TEXT,
            status TEXT NOT NULL,
            posted_at INTEGER,
            error TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(window_start, window_end)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS digest_entries (
            digest_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            sources_json TEXT NOT NULL,
            item_ids_json TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (digest_id, position),
            FOREIGN KEY (digest_id) REFERENCES digests(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS summary_cache (
            canonical_hash TEXT NOT NULL,
            digest_language TEXT NOT NULL,
            summary TEXT NOT NULL,
            topic TEXT NOT NULL,
            language TEXT NOT NULL,
            relevance REAL NOT NULL,
            importance REAL NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (canonical_hash, digest_language)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dropped_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            raw_message_id INTEGER NOT NULL,
            reason TEXT NOT NULL,
            dropped_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS advisory_locks (
            lock_id INTEGER PRIMARY KEY,
            acquired_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_raw_messages_pending ON raw_messages(processed_at, processing_started_at, source_date)",
        "CREATE INDEX IF NOT EXISTS idx_raw_messages_hash ON raw_messages(canonical_hash)",
        "CREATE INDEX IF NOT EXISTS idx_items_status ON items(status, next_retry_at)",
        "CREATE INDEX IF NOT EXISTS idx_items_first_seen ON items(first_seen_at)",
        "CREATE INDEX IF NOT EXISTS idx_items_duplicate_of ON items(duplicate_of_item_id)",
        "CREATE INDEX IF NOT EXISTS idx_item_embeddings_created ON item_embeddings(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_clusters_window ON clusters(window_start, window_end)",
        "CREATE INDEX IF NOT EXISTS idx_cluster_members_item ON cluster_members(item_id)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}
