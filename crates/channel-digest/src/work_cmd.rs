//! `cdg work`, `cdg tick`, `cdg recover` and `cdg retry`.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use channel_digest_core::embedding::EmbeddingProvider;
use channel_digest_core::store::Store;

use crate::config::Config;
use crate::embedding;
use crate::enrichment;
use crate::filter::ContentFilter;
use crate::sqlite_store::SqliteStore;
use crate::worker::{EnrichmentWorker, WorkerSettings};

/// Wire a worker pool from configuration.
///
/// A disabled embedding provider yields no embedder at all, so dedup runs
/// the strict hash check only.
pub fn build_worker(store: Arc<dyn Store>, config: &Config) -> Result<EnrichmentWorker> {
    let enricher = enrichment::create_enricher(&config.enrichment)?;
    let embedder: Option<Arc<dyn EmbeddingProvider>> = if config.embedding.is_enabled() {
        Some(embedding::create_provider(&config.embedding)?)
    } else {
        None
    };
    let filter = Arc::new(ContentFilter::new(&config.filters)?);

    Ok(EnrichmentWorker::new(
        store,
        enricher,
        embedder,
        filter,
        WorkerSettings::from_config(config),
    ))
}

/// `cdg work`: run the pool until `cancel` fires.
pub async fn run_work(config: &Config, cancel: CancellationToken) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let pool = store.pool().clone();
    let worker = Arc::new(build_worker(Arc::new(store), config)?);

    worker.run(cancel).await?;

    pool.close().await;
    Ok(())
}

/// `cdg tick`: one claim-and-process round, then exit.
pub async fn run_tick(config: &Config, cancel: CancellationToken) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let pool = store.pool().clone();
    let worker = build_worker(Arc::new(store), config)?;

    let report = worker.tick(&cancel).await?;
    println!("tick");
    println!("  claimed: {}", report.claimed);
    println!("  completed: {}", report.completed);
    println!("  retrying: {}", report.retrying);
    println!("  failed: {}", report.failed);
    println!("  aborted: {}", report.aborted);

    pool.close().await;
    Ok(())
}

/// `cdg recover`
pub async fn run_recover(config: &Config) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let recovered = store
        .recover_stuck_claims(config.stale_claim_after(), Utc::now())
        .await?;
    println!(
        "Recovered {} claim{} older than {}s.",
        recovered,
        if recovered == 1 { "" } else { "s" },
        config.worker.stale_claim_after_secs
    );
    store.pool().close().await;
    Ok(())
}

/// `cdg retry <raw_id>`: move a terminally failed message back to `retry`.
pub async fn run_retry(config: &Config, raw_message_id: i64) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let requeued = store
        .requeue_failed(raw_message_id, Utc::now())
        .await
        .with_context(|| format!("Failed to requeue message {}", raw_message_id))?;

    if requeued {
        tracing::info!(raw_message_id, "message requeued by operator");
        println!("Message {} requeued.", raw_message_id);
    } else {
        println!(
            "Message {} has no failed item; nothing to requeue.",
            raw_message_id
        );
    }

    store.pool().close().await;
    Ok(())
}
