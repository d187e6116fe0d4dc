//! Pipeline statistics and failure listing.
//!
//! `cdg stats` prints queue depth, item states, embedding coverage, digest
//! outcomes and a per-channel breakdown. `cdg errors` lists messages that
//! exhausted their retries, for use with `cdg retry`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use channel_digest_core::models::PipelineCounts;
use channel_digest_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Per-channel item breakdown.
struct ChannelStats {
    channel: String,
    messages: i64,
    ready: i64,
    duplicates: i64,
    last_message_ts: Option<i64>,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let counts = store.pipeline_counts().await?;
    let channels = channel_stats(store.pool()).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Channel Digest: Pipeline Stats");
    println!("===============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    print_counts(&counts);

    if !channels.is_empty() {
        println!();
        println!("  By channel:");
        println!(
            "  {:<28} {:>8} {:>8} {:>10}   {}",
            "CHANNEL", "MSGS", "READY", "DUPLICATE", "LAST MESSAGE"
        );
        println!("  {}", "-".repeat(76));
        for c in &channels {
            let last = match c.last_message_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<28} {:>8} {:>8} {:>10}   {}",
                c.channel, c.messages, c.ready, c.duplicates, last
            );
        }
    }
    println!();

    store.pool().close().await;
    Ok(())
}

fn print_counts(c: &PipelineCounts) {
    println!("  Messages:    {}", c.raw_messages);
    println!("    pending:   {}", c.unprocessed);
    println!("    claimed:   {}", c.claimed);
    println!();
    println!("  Items:       ready {} / retry {} / error {} / digested {}", c.ready, c.retry, c.error, c.digested);
    println!("  Duplicates:  {}", c.duplicates);
    let enriched = c.ready + c.digested;
    println!(
        "  Embedded:    {} / {} ({}%)",
        c.embeddings,
        enriched,
        if enriched > 0 {
            (c.embeddings * 100) / enriched
        } else {
            0
        }
    );
    println!("  Digests:     posted {} / failed {}", c.digests_posted, c.digests_failed);
}

async fn channel_stats(pool: &SqlitePool) -> Result<Vec<ChannelStats>> {
    let rows = sqlx::query(
        r#"
        SELECT
            r.channel,
            COUNT(*) AS messages,
            SUM(CASE WHEN i.status = 'ready' THEN 1 ELSE 0 END) AS ready,
            SUM(CASE WHEN i.duplicate_of_item_id IS NOT NULL THEN 1 ELSE 0 END) AS duplicates,
            MAX(r.source_date) AS last_message_ts
        FROM raw_messages r
        LEFT JOIN items i ON i.raw_message_id = r.id
        GROUP BY r.channel
        ORDER BY messages DESC, r.channel
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ChannelStats {
            channel: row.get("channel"),
            messages: row.get("messages"),
            ready: row.get::<Option<i64>, _>("ready").unwrap_or(0),
            duplicates: row.get::<Option<i64>, _>("duplicates").unwrap_or(0),
            last_message_ts: row.get("last_message_ts"),
        })
        .collect())
}

/// `cdg errors`
pub async fn run_errors(config: &Config, limit: usize) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let failed = store.list_failed_items(limit).await?;

    if failed.is_empty() {
        println!("No terminally failed messages.");
    } else {
        println!(
            "{:<8} {:<24} {:>10} {:>6}  {}",
            "RAW ID", "CHANNEL", "MSG ID", "TRIES", "ERROR"
        );
        for item in &failed {
            println!(
                "{:<8} {:<24} {:>10} {:>6}  {}",
                item.raw_message_id,
                item.channel,
                item.source_message_id,
                item.retry_count,
                item.error.as_deref().unwrap_or("")
            );
        }
        println!();
        println!("Requeue one with: cdg retry <RAW ID>");
    }

    store.pool().close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
