//! `cdg cluster`, `cdg digest` and `cdg clear-digest-errors`.
//!
//! Windows are given either as explicit RFC 3339 bounds (`--start`,
//! `--end`) or as `--last-hours N`, meaning the N whole hours ending at the
//! most recent hour boundary.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use channel_digest_core::models::Window;
use channel_digest_core::store::Store;

use crate::assembler::{DigestAssembler, DigestOutcome, DigestSettings};
use crate::clustering::ClusteringEngine;
use crate::config::Config;
use crate::publisher;
use crate::sqlite_store::SqliteStore;

/// Resolve CLI window arguments against `now`.
pub fn parse_window(
    start: Option<&str>,
    end: Option<&str>,
    last_hours: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Window> {
    match (start, end, last_hours) {
        (Some(start), Some(end), None) => Window::new(parse_ts(start)?, parse_ts(end)?),
        (None, None, Some(hours)) => {
            if hours <= 0 {
                bail!("--last-hours must be positive");
            }
            let end = now
                .duration_trunc(Duration::hours(1))
                .context("Failed to align window to the hour")?;
            Window::new(end - Duration::hours(hours), end)
        }
        (None, None, None) => bail!("Specify a window with --start/--end or --last-hours"),
        _ => bail!("--start and --end must be given together, and not with --last-hours"),
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid RFC 3339 timestamp: '{}'", s))
}

/// `cdg cluster`
pub async fn run_cluster(config: &Config, window: &Window, cancel: CancellationToken) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let pool = store.pool().clone();
    let engine = ClusteringEngine::from_config(Arc::new(store), config);

    let report = engine.rebuild(window, &cancel).await?;
    println!("cluster {}", window);
    println!("  items: {}", report.items);
    println!("  with embeddings: {}", report.embedded_items);
    println!("  clusters: {}", report.clusters);
    println!("  largest: {}", report.largest);

    pool.close().await;
    Ok(())
}

/// `cdg digest`: rebuild clusters (unless `skip_cluster`), then assemble
/// and publish. `dry_run` prints the entries that would be published.
pub async fn run_digest(
    config: &Config,
    window: &Window,
    skip_cluster: bool,
    dry_run: bool,
    cancel: CancellationToken,
) -> Result<()> {
    if config.digest.chat_id.is_empty() {
        bail!("digest.chat_id must be set to publish digests");
    }

    let store = SqliteStore::connect(config).await?;
    let pool = store.pool().clone();
    let store: Arc<dyn Store> = Arc::new(store);

    if !skip_cluster {
        ClusteringEngine::from_config(Arc::clone(&store), config)
            .rebuild(window, &cancel)
            .await?;
    }

    let assembler = DigestAssembler::new(
        Arc::clone(&store),
        publisher::create_publisher(&config.publisher)?,
        DigestSettings::from_config(config),
    );

    if dry_run {
        let entries = assembler.build(window).await?;
        println!("{}", serde_json::to_string_pretty(&entries)?);
        pool.close().await;
        return Ok(());
    }

    let outcome = assembler.assemble(window, &cancel).await?;
    match &outcome {
        DigestOutcome::Published {
            digest_id,
            chat_id,
            message_id,
            entries,
            items,
        } => {
            println!("digest {}", window);
            println!("  published: #{} ({}/{})", digest_id, chat_id, message_id);
            println!("  entries: {}", entries);
            println!("  items: {}", items);
        }
        DigestOutcome::Locked => println!("digest {}: locked by another assembler", window),
        DigestOutcome::AlreadyExists => println!("digest {}: already handled", window),
        DigestOutcome::Empty => println!("digest {}: no eligible items", window),
        DigestOutcome::Failed { error } => {
            pool.close().await;
            bail!("Digest publication failed: {}", error);
        }
    }

    pool.close().await;
    Ok(())
}

/// `cdg clear-digest-errors`
pub async fn run_clear_digest_errors(config: &Config) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let cleared = store.clear_digest_errors().await?;
    println!("Cleared {} failed digest record(s).", cleared);
    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_explicit_window() {
        let w = parse_window(
            Some("2026-10-01T00:00:00Z"),
            Some("2026-10-01T06:00:00+02:00"),
            None,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(w.start, Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap());
        assert_eq!(w.end, Utc.with_ymd_and_hms(2026, 10, 1, 4, 0, 0).unwrap());
    }

    #[test]
    fn test_last_hours_aligns_to_hour() {
        let now = Utc.with_ymd_and_hms(2026, 10, 1, 12, 34, 56).unwrap();
        let w = parse_window(None, None, Some(6), now).unwrap();
        assert_eq!(w.end, Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap());
        assert_eq!(w.start, Utc.with_ymd_and_hms(2026, 10, 1, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_windows() {
        let now = Utc::now();
        assert!(parse_window(None, None, None, now).is_err());
        assert!(parse_window(Some("2026-10-01T00:00:00Z"), None, None, now).is_err());
        assert!(parse_window(None, None, Some(0), now).is_err());
        assert!(parse_window(Some("yesterday"), Some("today"), None, now).is_err());
        // end before start
        assert!(parse_window(
            Some("2026-10-02T00:00:00Z"),
            Some("2026-10-01T00:00:00Z"),
            None,
            now
        )
        .is_err());
    }
}
