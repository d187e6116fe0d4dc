//! SQLite-backed [`Store`] implementation.
//!
//! Every multi-statement operation runs in one transaction whose first
//! statement is a write, so the connection takes the writer lock up front
//! and waits on `busy_timeout` instead of failing mid-transaction. SQLite
//! admits one writer at a time, which is what makes concurrent claims
//! disjoint.
//!
//! Timestamps are INTEGER unix seconds; vectors are little-endian f32 BLOBs
//! (see [`vec_to_blob`]). Similarity search is a cosine scan over the
//! embeddings created after the query's time floor.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;

use channel_digest_core::digest::covered_item_ids;
use channel_digest_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use channel_digest_core::models::{
    Claim, ClusterDraft, ClusterMembership, Digest, DigestEntry, DuplicateRef,
    Item, ItemErrorRecord, ItemRef, ItemStatus, NewItem, NewRawMessage, PendingEmbedding,
    PipelineCounts, RawMessage, SourceRef, SummaryCacheEntry, Window, WindowItem,
};
use channel_digest_core::retry::RetryPolicy;
use channel_digest_core::similarity::best_match;
use channel_digest_core::store::{SimilarMatch, SimilarityQuery, Store};

use crate::config::Config;
use crate::db;

const RAW_COLUMNS: &str = "id, channel, source_message_id, source_date, text, entities_json, \
     media_json, forwarded_from, canonical_hash, processed_at, processing_started_at, \
     discoveries_extracted";

const ITEM_SELECT: &str = "SELECT i.id, i.raw_message_id, m.channel, m.source_message_id, \
     m.canonical_hash, i.relevance_score, i.importance_score, i.topic, i.summary, i.language, \
     i.status, i.retry_count, i.next_retry_at, i.first_seen_at, i.digested_at, i.error, \
     i.duplicate_of_item_id \
     FROM items i JOIN raw_messages m ON m.id = i.raw_message_id";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the configured database. The schema must already exist.
    pub async fn connect(config: &Config) -> Result<Self> {
        Ok(Self::new(db::connect(config).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_dt(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("timestamp out of range: {}", secs))
}

fn to_opt_dt(secs: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    secs.map(to_dt).transpose()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn raw_from_row(row: &SqliteRow) -> Result<RawMessage> {
    Ok(RawMessage {
        id: row.get("id"),
        channel: row.get("channel"),
        source_message_id: row.get("source_message_id"),
        source_date: to_dt(row.get("source_date"))?,
        text: row.get("text"),
        entities_json: row.get("entities_json"),
        media_json: row.get("media_json"),
        forwarded_from: row.get("forwarded_from"),
        canonical_hash: row.get("canonical_hash"),
        processed_at: to_opt_dt(row.get("processed_at"))?,
        processing_started_at: to_opt_dt(row.get("processing_started_at"))?,
        discoveries_extracted: row.get::<i64, _>("discoveries_extracted") != 0,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<Item> {
    let status: String = row.get("status");
    let retry_count: i64 = row.get("retry_count");
    Ok(Item {
        id: row.get("id"),
        raw_message_id: row.get("raw_message_id"),
        channel: row.get("channel"),
        source_message_id: row.get("source_message_id"),
        canonical_hash: row.get("canonical_hash"),
        relevance_score: row.get("relevance_score"),
        importance_score: row.get("importance_score"),
        topic: row.get("topic"),
        summary: row.get("summary"),
        language: row.get("language"),
        status: status.parse()?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        next_retry_at: to_opt_dt(row.get("next_retry_at"))?,
        first_seen_at: to_dt(row.get("first_seen_at"))?,
        digested_at: to_opt_dt(row.get("digested_at"))?,
        error: row.get("error"),
        duplicate_of_item_id: row.get("duplicate_of_item_id"),
    })
}

fn digest_from_row(row: &SqliteRow) -> Result<Digest> {
    let status: String = row.get("status");
    Ok(Digest {
        id: row.get("id"),
        window: Window::new(to_dt(row.get("window_start"))?, to_dt(row.get("window_end"))?)?,
        chat_id: row.get("chat_id"),
        message_id: row.get("message_id"),
        status: status.parse()?,
        posted_at: to_opt_dt(row.get("posted_at"))?,
        error: row.get("error"),
        created_at: to_dt(row.get("created_at"))?,
    })
}

async fn delete_window_clusters(conn: &mut SqliteConnection, window: &Window) -> Result<u64> {
    sqlx::query(
        r#"
        DELETE FROM cluster_members WHERE cluster_id IN (
            SELECT id FROM clusters WHERE window_start = ? AND window_end = ?
        )
        "#,
    )
    .bind(window.start.timestamp())
    .bind(window.end.timestamp())
    .execute(&mut *conn)
    .await?;

    let deleted = sqlx::query("DELETE FROM clusters WHERE window_start = ? AND window_end = ?")
        .bind(window.start.timestamp())
        .bind(window.end.timestamp())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(deleted)
}

async fn insert_cluster(
    conn: &mut SqliteConnection,
    window: &Window,
    topic: Option<&str>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO clusters (window_start, window_end, topic, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(window.start.timestamp())
    .bind(window.end.timestamp())
    .bind(topic)
    .bind(now.timestamp())
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn insert_member(conn: &mut SqliteConnection, cluster_id: i64, item_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cluster_members (cluster_id, item_id, position)
        VALUES (?, ?, (SELECT COUNT(*) FROM cluster_members WHERE cluster_id = ?))
        ON CONFLICT(cluster_id, item_id) DO NOTHING
        "#,
    )
    .bind(cluster_id)
    .bind(item_id)
    .bind(cluster_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_posted_digest(
    conn: &mut SqliteConnection,
    window: &Window,
    chat_id: &str,
    message_id: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    // An existing posted row makes the DO UPDATE a no-op, and RETURNING
    // then yields nothing.
    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO digests (window_start, window_end, chat_id, message_id, status, posted_at, created_at)
        VALUES (?, ?, ?, ?, 'posted', ?, ?)
        ON CONFLICT(window_start, window_end) DO UPDATE SET
            chat_id = excluded.chat_id,
            message_id = excluded.message_id,
            status = 'posted',
            posted_at = excluded.posted_at,
            error = NULL
        WHERE digests.status = 'error'
        RETURNING id
        "#,
    )
    .bind(window.start.timestamp())
    .bind(window.end.timestamp())
    .bind(chat_id)
    .bind(message_id)
    .bind(now.timestamp())
    .bind(now.timestamp())
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(id) => Ok(id),
        None => {
            let id: i64 = sqlx::query_scalar(
                "SELECT id FROM digests WHERE window_start = ? AND window_end = ?",
            )
            .bind(window.start.timestamp())
            .bind(window.end.timestamp())
            .fetch_one(&mut *conn)
            .await?;
            Ok(id)
        }
    }
}

async fn replace_entries(
    conn: &mut SqliteConnection,
    digest_id: i64,
    entries: &[DigestEntry],
) -> Result<()> {
    sqlx::query("DELETE FROM digest_entries WHERE digest_id = ?")
        .bind(digest_id)
        .execute(&mut *conn)
        .await?;

    for (position, entry) in entries.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO digest_entries (digest_id, position, title, body, sources_json, item_ids_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(digest_id)
        .bind(position as i64)
        .bind(&entry.title)
        .bind(&entry.body)
        .bind(serde_json::to_string(&entry.sources)?)
        .bind(serde_json::to_string(&entry.item_ids)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn set_digested(
    conn: &mut SqliteConnection,
    item_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<u64> {
    if item_ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE items SET status = 'digested', digested_at = ? WHERE status = 'ready' AND id IN ({})",
        placeholders(item_ids.len())
    );
    let mut query = sqlx::query(&sql).bind(now.timestamp());
    for id in item_ids {
        query = query.bind(id);
    }
    Ok(query.execute(&mut *conn).await?.rows_affected())
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_raw_message(&self, msg: &NewRawMessage) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO raw_messages (channel, source_message_id, source_date, text,
                                      entities_json, media_json, forwarded_from, canonical_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(channel, source_message_id) DO UPDATE SET
                source_date = excluded.source_date,
                text = excluded.text,
                entities_json = excluded.entities_json,
                media_json = excluded.media_json,
                forwarded_from = excluded.forwarded_from,
                canonical_hash = excluded.canonical_hash
            RETURNING id
            "#,
        )
        .bind(&msg.channel)
        .bind(msg.source_message_id)
        .bind(msg.source_date.timestamp())
        .bind(&msg.text)
        .bind(&msg.entities_json)
        .bind(&msg.media_json)
        .bind(&msg.forwarded_from)
        .bind(&msg.canonical_hash)
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to upsert message {}/{}",
                msg.channel, msg.source_message_id
            )
        })?;
        Ok(id)
    }

    async fn get_raw_message(&self, id: i64) -> Result<Option<RawMessage>> {
        let sql = format!("SELECT {RAW_COLUMNS} FROM raw_messages WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(raw_from_row).transpose()
    }

    async fn claim_pending_batch(
        &self,
        limit: usize,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE raw_messages SET processing_started_at = ?
            WHERE id IN (
                SELECT m.id FROM raw_messages m
                LEFT JOIN items i ON i.raw_message_id = m.id
                WHERE m.processing_started_at IS NULL
                  AND m.processed_at IS NULL
                  AND (
                      i.id IS NULL
                      OR i.status IN ('ready', 'digested')
                      OR (i.status IN ('error', 'retry')
                          AND i.retry_count < ?
                          AND (i.next_retry_at IS NULL OR i.next_retry_at <= ?))
                  )
                ORDER BY m.source_date, m.id
                LIMIT ?
            )
            RETURNING {RAW_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now.timestamp())
            .bind(i64::from(max_retries))
            .bind(now.timestamp())
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to claim pending messages")?;

        let mut messages = rows.iter().map(raw_from_row).collect::<Result<Vec<_>>>()?;
        if messages.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }
        messages.sort_by(|a, b| a.source_date.cmp(&b.source_date).then(a.id.cmp(&b.id)));

        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        let promote = format!(
            "UPDATE items SET status = 'retry' WHERE status = 'error' AND raw_message_id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&promote);
        for id in &ids {
            query = query.bind(id);
        }
        query.execute(&mut *tx).await?;

        let existing = format!(
            "SELECT id, raw_message_id, status, retry_count FROM items WHERE raw_message_id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&existing);
        for id in &ids {
            query = query.bind(id);
        }
        let item_rows = query.fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let mut items: HashMap<i64, (i64, ItemStatus, u32)> = HashMap::new();
        for row in &item_rows {
            let retry_count: i64 = row.get("retry_count");
            let status: String = row.get("status");
            items.insert(
                row.get("raw_message_id"),
                (
                    row.get("id"),
                    status.parse()?,
                    u32::try_from(retry_count).unwrap_or(u32::MAX),
                ),
            );
        }

        Ok(messages
            .into_iter()
            .map(|message| {
                let existing = items.get(&message.id).copied();
                Claim {
                    item_id: existing.map(|(id, _, _)| id),
                    item_status: existing.map(|(_, status, _)| status),
                    retry_count: existing.map_or(0, |(_, _, n)| n),
                    message,
                }
            })
            .collect())
    }

    async fn release_claim(&self, raw_message_id: i64) -> Result<()> {
        sqlx::query("UPDATE raw_messages SET processing_started_at = NULL WHERE id = ?")
            .bind(raw_message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_processed(&self, raw_message_id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE raw_messages
            SET processed_at = COALESCE(processed_at, ?), processing_started_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(now.timestamp())
        .bind(raw_message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recover_stuck_claims(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let horizon = now - stale_after;
        let result = sqlx::query(
            r#"
            UPDATE raw_messages SET processing_started_at = NULL
            WHERE processed_at IS NULL
              AND processing_started_at IS NOT NULL
              AND processing_started_at <= ?
            "#,
        )
        .bind(horizon.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn requeue_failed(&self, raw_message_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            r#"
            UPDATE items SET status = 'retry', retry_count = 0, next_retry_at = ?
            WHERE raw_message_id = ? AND status = 'error'
            "#,
        )
        .bind(now.timestamp())
        .bind(raw_message_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if changed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE raw_messages SET processed_at = NULL, processing_started_at = NULL WHERE id = ?",
        )
        .bind(raw_message_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn save_item(&self, item: &NewItem) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO items (raw_message_id, relevance_score, importance_score, topic, summary,
                               language, status, retry_count, first_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, 'ready', 0, ?)
            ON CONFLICT(raw_message_id) DO UPDATE SET
                relevance_score = excluded.relevance_score,
                importance_score = excluded.importance_score,
                topic = excluded.topic,
                summary = excluded.summary,
                language = excluded.language,
                status = CASE WHEN items.status = 'digested' THEN 'digested' ELSE 'ready' END,
                next_retry_at = NULL,
                error = NULL
            RETURNING id
            "#,
        )
        .bind(item.raw_message_id)
        .bind(item.relevance_score)
        .bind(item.importance_score)
        .bind(&item.topic)
        .bind(&item.summary)
        .bind(&item.language)
        .bind(item.first_seen_at.timestamp())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to save item for message {}", item.raw_message_id))?;
        Ok(id)
    }

    async fn save_item_error(
        &self,
        raw_message_id: i64,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ItemErrorRecord> {
        let mut tx = self.pool.begin().await?;

        // INSERT ... SELECT needs its WHERE clause for the upsert to parse.
        let row = sqlx::query(
            r#"
            INSERT INTO items (raw_message_id, status, retry_count, first_seen_at, error)
            SELECT id, 'error', 1, source_date, ? FROM raw_messages WHERE id = ?
            ON CONFLICT(raw_message_id) DO UPDATE SET
                retry_count = items.retry_count + 1,
                status = 'error',
                error = excluded.error
            RETURNING id, retry_count
            "#,
        )
        .bind(error)
        .bind(raw_message_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            bail!("raw message {} not found", raw_message_id);
        };
        let item_id: i64 = row.get("id");
        let retry_count = u32::try_from(row.get::<i64, _>("retry_count")).unwrap_or(u32::MAX);
        let next_retry_at = policy.next_retry_at(retry_count, now);

        sqlx::query("UPDATE items SET next_retry_at = ? WHERE id = ?")
            .bind(next_retry_at.timestamp())
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ItemErrorRecord {
            item_id,
            retry_count,
            next_retry_at,
            exhausted: policy.is_exhausted(retry_count),
        })
    }

    async fn get_item(&self, id: i64) -> Result<Option<Item>> {
        let sql = format!("{ITEM_SELECT} WHERE i.id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn get_item_by_raw_message(&self, raw_message_id: i64) -> Result<Option<Item>> {
        let sql = format!("{ITEM_SELECT} WHERE i.raw_message_id = ?");
        let row = sqlx::query(&sql)
            .bind(raw_message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn find_strict_duplicate(
        &self,
        canonical_hash: &str,
        exclude_raw_message_id: i64,
    ) -> Result<Option<ItemRef>> {
        let row = sqlx::query(
            r#"
            SELECT i.id, i.first_seen_at, i.status
            FROM items i JOIN raw_messages m ON m.id = i.raw_message_id
            WHERE m.canonical_hash = ?
              AND m.id != ?
              AND m.processed_at IS NOT NULL
              AND i.status IN ('ready', 'digested')
            ORDER BY i.first_seen_at, i.id
            LIMIT 1
            "#,
        )
        .bind(canonical_hash)
        .bind(exclude_raw_message_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let status: String = row.get("status");
                Ok(Some(ItemRef {
                    item_id: row.get("id"),
                    first_seen_at: to_dt(row.get("first_seen_at"))?,
                    status: status.parse()?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn mark_duplicate(&self, item_id: i64, canonical_item_id: i64) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        // Resolve the canonical's own root inline and re-point anything that
        // already pointed at `item_id`.
        let changed = sqlx::query(
            r#"
            UPDATE items SET duplicate_of_item_id = (
                SELECT COALESCE(c.duplicate_of_item_id, c.id) FROM items c WHERE c.id = ?
            )
            WHERE (id = ? OR duplicate_of_item_id = ?)
              AND EXISTS (
                SELECT 1 FROM items c
                WHERE c.id = ? AND COALESCE(c.duplicate_of_item_id, c.id) != ?
              )
            "#,
        )
        .bind(canonical_item_id)
        .bind(item_id)
        .bind(item_id)
        .bind(canonical_item_id)
        .bind(item_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if changed == 0 {
            tx.rollback().await?;
            bail!(
                "cannot mark item {} as duplicate of {}: missing item or cycle",
                item_id,
                canonical_item_id
            );
        }

        let root: Option<i64> =
            sqlx::query_scalar("SELECT duplicate_of_item_id FROM items WHERE id = ?")
                .bind(item_id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        root.ok_or_else(|| anyhow!("item {} vanished while linking", item_id))
    }

    async fn list_failed_items(&self, limit: usize) -> Result<Vec<Item>> {
        let sql = format!(
            "{ITEM_SELECT} WHERE i.status = 'error' AND m.processed_at IS NOT NULL \
             ORDER BY i.id DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn save_embedding(
        &self,
        item_id: i64,
        vector: &[f32],
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO item_embeddings (item_id, dims, embedding, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                dims = excluded.dims,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(item_id)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .bind(now.timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save embedding for item {}", item_id))?;
        Ok(())
    }

    async fn get_embedding(&self, item_id: i64) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT embedding FROM item_embeddings WHERE item_id = ?")
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    async fn items_missing_embeddings(
        &self,
        min_relevance: f64,
        limit: usize,
    ) -> Result<Vec<PendingEmbedding>> {
        let rows = sqlx::query(
            r#"
            SELECT i.id, CASE WHEN i.summary = '' THEN m.text ELSE i.summary END AS text
            FROM items i
            JOIN raw_messages m ON m.id = i.raw_message_id
            LEFT JOIN item_embeddings e ON e.item_id = i.id
            WHERE e.item_id IS NULL
              AND i.status = 'ready'
              AND i.duplicate_of_item_id IS NULL
              AND i.relevance_score >= ?
            ORDER BY i.id
            LIMIT ?
            "#,
        )
        .bind(min_relevance)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PendingEmbedding {
                item_id: row.get("id"),
                text: row.get("text"),
            })
            .collect())
    }

    async fn find_similar_item(&self, query: &SimilarityQuery<'_>) -> Result<Option<SimilarMatch>> {
        let rows = sqlx::query(
            r#"
            SELECT e.item_id, e.embedding, i.first_seen_at, i.duplicate_of_item_id, i.status
            FROM item_embeddings e
            JOIN items i ON i.id = e.item_id
            JOIN raw_messages m ON m.id = i.raw_message_id
            WHERE e.created_at > ?
              AND i.status IN ('ready', 'digested')
              AND (? IS NULL OR m.channel = ?)
              AND (? IS NULL OR i.id != ?)
            "#,
        )
        .bind(query.since.timestamp())
        .bind(query.channel)
        .bind(query.channel)
        .bind(query.exclude_item_id)
        .bind(query.exclude_item_id)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let status: String = row.get("status");
            candidates.push(SimilarMatch {
                item_id: row.get("item_id"),
                similarity: cosine_similarity(query.vector, &blob_to_vec(&blob)),
                first_seen_at: to_dt(row.get("first_seen_at"))?,
                duplicate_of_item_id: row.get("duplicate_of_item_id"),
                digested: status == ItemStatus::Digested.as_str(),
            });
        }
        Ok(best_match(candidates, query.threshold))
    }

    async fn load_window_items(
        &self,
        window: &Window,
        importance_threshold: f64,
        limit: usize,
    ) -> Result<Vec<WindowItem>> {
        let rows = sqlx::query(
            r#"
            SELECT i.id, m.channel, m.source_message_id, i.topic, i.summary,
                   i.importance_score, i.first_seen_at, e.embedding
            FROM items i
            JOIN raw_messages m ON m.id = i.raw_message_id
            LEFT JOIN item_embeddings e ON e.item_id = i.id
            WHERE i.status = 'ready'
              AND i.digested_at IS NULL
              AND i.duplicate_of_item_id IS NULL
              AND i.importance_score >= ?
              AND i.first_seen_at >= ?
              AND i.first_seen_at < ?
            ORDER BY i.importance_score DESC, i.first_seen_at, i.id
            LIMIT ?
            "#,
        )
        .bind(importance_threshold)
        .bind(window.start.timestamp())
        .bind(window.end.timestamp())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let blob: Option<Vec<u8>> = row.get("embedding");
                Ok(WindowItem {
                    item_id: row.get("id"),
                    channel: row.get("channel"),
                    source_message_id: row.get("source_message_id"),
                    topic: row.get("topic"),
                    summary: row.get("summary"),
                    importance_score: row.get("importance_score"),
                    first_seen_at: to_dt(row.get("first_seen_at"))?,
                    embedding: blob.map(|b| blob_to_vec(&b)),
                })
            })
            .collect()
    }

    async fn load_duplicates_of(&self, canonical_ids: &[i64]) -> Result<Vec<DuplicateRef>> {
        if canonical_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT i.id, i.duplicate_of_item_id, m.channel, m.source_message_id
            FROM items i JOIN raw_messages m ON m.id = i.raw_message_id
            WHERE i.status = 'ready'
              AND i.digested_at IS NULL
              AND i.duplicate_of_item_id IN ({})
            ORDER BY i.id
            "#,
            placeholders(canonical_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in canonical_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| DuplicateRef {
                item_id: row.get("id"),
                duplicate_of_item_id: row.get("duplicate_of_item_id"),
                channel: row.get("channel"),
                source_message_id: row.get("source_message_id"),
            })
            .collect())
    }

    async fn delete_clusters_for_window(&self, window: &Window) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let deleted = delete_window_clusters(&mut tx, window).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn create_cluster(
        &self,
        window: &Window,
        topic: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_cluster(&mut conn, window, topic, now).await
    }

    async fn add_to_cluster(&self, cluster_id: i64, item_id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_member(&mut conn, cluster_id, item_id).await
    }

    async fn replace_window_clusters(
        &self,
        window: &Window,
        clusters: &[ClusterDraft],
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        delete_window_clusters(&mut tx, window).await?;

        let mut ids = Vec::with_capacity(clusters.len());
        for draft in clusters {
            let cluster_id = insert_cluster(&mut tx, window, draft.topic.as_deref(), now).await?;
            for item_id in &draft.item_ids {
                insert_member(&mut tx, cluster_id, *item_id).await?;
            }
            ids.push(cluster_id);
        }
        tx.commit()
            .await
            .with_context(|| format!("Failed to rebuild clusters for {}", window))?;
        Ok(ids)
    }

    async fn load_window_clusters(&self, window: &Window) -> Result<Vec<ClusterMembership>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.topic, cm.item_id
            FROM clusters c
            LEFT JOIN cluster_members cm ON cm.cluster_id = c.id
            WHERE c.window_start = ? AND c.window_end = ?
            ORDER BY c.id, cm.position
            "#,
        )
        .bind(window.start.timestamp())
        .bind(window.end.timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut clusters: Vec<ClusterMembership> = Vec::new();
        for row in &rows {
            let cluster_id: i64 = row.get("id");
            let item_id: Option<i64> = row.get("item_id");
            if clusters.last().map(|c| c.cluster_id) != Some(cluster_id) {
                clusters.push(ClusterMembership {
                    cluster_id,
                    topic: row.get("topic"),
                    item_ids: Vec::new(),
                });
            }
            if let (Some(current), Some(item_id)) = (clusters.last_mut(), item_id) {
                current.item_ids.push(item_id);
            }
        }
        Ok(clusters)
    }

    async fn digest_exists(
        &self,
        window: &Window,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) > 0 FROM digests
            WHERE window_start = ? AND window_end = ?
              AND (status = 'posted' OR (status = 'error' AND created_at > ?))
            "#,
        )
        .bind(window.start.timestamp())
        .bind(window.end.timestamp())
        .bind((now - grace).timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn save_digest(
        &self,
        window: &Window,
        chat_id: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        upsert_posted_digest(&mut conn, window, chat_id, message_id, now).await
    }

    async fn save_digest_entries(&self, digest_id: i64, entries: &[DigestEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        replace_entries(&mut tx, digest_id, entries).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_digest_error(
        &self,
        window: &Window,
        chat_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO digests (window_start, window_end, chat_id, status, error, created_at)
            VALUES (?, ?, ?, 'error', ?, ?)
            ON CONFLICT(window_start, window_end) DO UPDATE SET
                chat_id = excluded.chat_id,
                error = excluded.error,
                created_at = excluded.created_at
            WHERE digests.status = 'error'
            "#,
        )
        .bind(window.start.timestamp())
        .bind(window.end.timestamp())
        .bind(chat_id)
        .bind(error)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_digest_errors(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM digest_entries WHERE digest_id IN (SELECT id FROM digests WHERE status = 'error')",
        )
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM digests WHERE status = 'error'")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }

    async fn mark_items_digested(&self, item_ids: &[i64], now: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        set_digested(&mut conn, item_ids, now).await
    }

    async fn record_published_digest(
        &self,
        window: &Window,
        chat_id: &str,
        message_id: &str,
        entries: &[DigestEntry],
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let digest_id = upsert_posted_digest(&mut tx, window, chat_id, message_id, now).await?;
        replace_entries(&mut tx, digest_id, entries).await?;
        set_digested(&mut tx, &covered_item_ids(entries), now).await?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to record digest for {}", window))?;
        Ok(digest_id)
    }

    async fn get_digest(&self, window: &Window) -> Result<Option<Digest>> {
        let row = sqlx::query(
            r#"
            SELECT id, window_start, window_end, chat_id, message_id, status, posted_at, error, created_at
            FROM digests WHERE window_start = ? AND window_end = ?
            "#,
        )
        .bind(window.start.timestamp())
        .bind(window.end.timestamp())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(digest_from_row).transpose()
    }

    async fn get_digest_entries(&self, digest_id: i64) -> Result<Vec<DigestEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT title, body, sources_json, item_ids_json
            FROM digest_entries WHERE digest_id = ? ORDER BY position
            "#,
        )
        .bind(digest_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let sources: String = row.get("sources_json");
                let item_ids: String = row.get("item_ids_json");
                Ok(DigestEntry {
                    title: row.get("title"),
                    body: row.get("body"),
                    sources: serde_json::from_str::<Vec<SourceRef>>(&sources)?,
                    item_ids: serde_json::from_str(&item_ids)?,
                })
            })
            .collect()
    }

    async fn get_summary(
        &self,
        canonical_hash: &str,
        digest_language: &str,
    ) -> Result<Option<SummaryCacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT canonical_hash, digest_language, summary, topic, language, relevance, importance
            FROM summary_cache WHERE canonical_hash = ? AND digest_language = ?
            "#,
        )
        .bind(canonical_hash)
        .bind(digest_language)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| SummaryCacheEntry {
            canonical_hash: row.get("canonical_hash"),
            digest_language: row.get("digest_language"),
            summary: row.get("summary"),
            topic: row.get("topic"),
            language: row.get("language"),
            relevance: row.get("relevance"),
            importance: row.get("importance"),
        }))
    }

    async fn upsert_summary(&self, entry: &SummaryCacheEntry, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO summary_cache (canonical_hash, digest_language, summary, topic, language,
                                       relevance, importance, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(canonical_hash, digest_language) DO UPDATE SET
                summary = excluded.summary,
                topic = excluded.topic,
                language = excluded.language,
                relevance = excluded.relevance,
                importance = excluded.importance,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.canonical_hash)
        .bind(&entry.digest_language)
        .bind(&entry.summary)
        .bind(&entry.topic)
        .bind(&entry.language)
        .bind(entry.relevance)
        .bind(entry.importance)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_dropped(
        &self,
        raw_message_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO dropped_messages (raw_message_id, reason, dropped_at) VALUES (?, ?, ?)",
        )
        .bind(raw_message_id)
        .bind(reason)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        lock_id: i64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO advisory_locks (lock_id, acquired_at) VALUES (?, ?)
            ON CONFLICT(lock_id) DO UPDATE SET acquired_at = excluded.acquired_at
            WHERE advisory_locks.acquired_at <= ?
            "#,
        )
        .bind(lock_id)
        .bind(now.timestamp())
        .bind((now - ttl).timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, lock_id: i64, acquired_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("DELETE FROM advisory_locks WHERE lock_id = ? AND acquired_at = ?")
            .bind(lock_id)
            .bind(acquired_at.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pipeline_counts(&self) -> Result<PipelineCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM raw_messages) AS raw_messages,
                (SELECT COUNT(*) FROM raw_messages WHERE processed_at IS NULL) AS unprocessed,
                (SELECT COUNT(*) FROM raw_messages
                    WHERE processing_started_at IS NOT NULL AND processed_at IS NULL) AS claimed,
                (SELECT COUNT(*) FROM items WHERE status = 'ready') AS ready,
                (SELECT COUNT(*) FROM items WHERE status = 'error') AS error,
                (SELECT COUNT(*) FROM items WHERE status = 'retry') AS retry,
                (SELECT COUNT(*) FROM items WHERE status = 'digested') AS digested,
                (SELECT COUNT(*) FROM items WHERE duplicate_of_item_id IS NOT NULL) AS duplicates,
                (SELECT COUNT(*) FROM item_embeddings) AS embeddings,
                (SELECT COUNT(*) FROM digests WHERE status = 'posted') AS digests_posted,
                (SELECT COUNT(*) FROM digests WHERE status = 'error') AS digests_failed
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PipelineCounts {
            raw_messages: row.get("raw_messages"),
            unprocessed: row.get("unprocessed"),
            claimed: row.get("claimed"),
            ready: row.get("ready"),
            error: row.get("error"),
            retry: row.get("retry"),
            digested: row.get("digested"),
            duplicates: row.get("duplicates"),
            embeddings: row.get("embeddings"),
            digests_posted: row.get("digests_posted"),
            digests_failed: row.get("digests_failed"),
        })
    }
}
