use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::Arc;

use channel_digest_core::embedding::EmbeddingProvider;
use channel_digest_core::store::Store;

use crate::config::Config;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub pending: usize,
    pub embedded: u64,
    pub failed: u64,
}

/// Embed ready items above `min_relevance` that have no vector yet.
///
/// A failed batch is counted and skipped; its items stay pending.
pub async fn embed_pending(
    store: &dyn Store,
    provider: &dyn EmbeddingProvider,
    min_relevance: f64,
    batch_size: usize,
    limit: usize,
) -> Result<EmbedReport> {
    let pending = store.items_missing_embeddings(min_relevance, limit).await?;
    let mut report = EmbedReport {
        pending: pending.len(),
        ..EmbedReport::default()
    };

    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        match provider.embed_batch(&texts).await {
            Ok(vectors) => {
                for (item, vector) in batch.iter().zip(vectors.iter()) {
                    store.save_embedding(item.item_id, vector, Utc::now()).await?;
                    report.embedded += 1;
                }
            }
            Err(e) => {
                tracing::warn!(batch = batch.len(), error = %e, "embedding batch failed");
                report.failed += batch.len() as u64;
            }
        }
    }

    Ok(report)
}

/// `cdg embed pending`
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let store = SqliteStore::connect(config).await?;
    let limit = limit.unwrap_or(usize::MAX);

    if dry_run {
        let pending = store
            .items_missing_embeddings(config.worker.min_relevance, limit)
            .await?;
        println!("embed pending (dry-run)");
        println!("  items needing embeddings: {}", pending.len());
        store.pool().close().await;
        return Ok(());
    }

    let provider: Arc<dyn EmbeddingProvider> = embedding::create_provider(&config.embedding)?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    let report = embed_pending(
        &store,
        provider.as_ref(),
        config.worker.min_relevance,
        batch_size,
        limit,
    )
    .await?;

    println!("embed pending");
    println!("  total pending: {}", report.pending);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use channel_digest_core::error::ProviderError;
    use channel_digest_core::models::{NewItem, NewRawMessage};
    use channel_digest_core::store::memory::InMemoryStore;

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingProvider for UnitEmbedder {
        fn model_name(&self) -> &str {
            "unit"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![0.0, 1.0]).collect())
        }
    }

    async fn item(store: &InMemoryStore, msg_id: i64, relevance: f64) -> i64 {
        let now = Utc::now();
        let raw = store
            .upsert_raw_message(&NewRawMessage::new("@c", msg_id, now, "body"))
            .await
            .unwrap();
        store
            .save_item(&NewItem {
                raw_message_id: raw,
                relevance_score: relevance,
                importance_score: 0.5,
                topic: "t".into(),
                summary: "s".into(),
                language: "en".into(),
                first_seen_at: now,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_backfill_only_relevant_items() {
        let store = InMemoryStore::new();
        let relevant = item(&store, 1, 0.9).await;
        let noise = item(&store, 2, 0.1).await;

        let report = embed_pending(&store, &UnitEmbedder, 0.3, 8, 100).await.unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(report.embedded, 1);
        assert!(store.get_embedding(relevant).await.unwrap().is_some());
        assert!(store.get_embedding(noise).await.unwrap().is_none());

        let again = embed_pending(&store, &UnitEmbedder, 0.3, 8, 100).await.unwrap();
        assert_eq!(again.pending, 0);
    }
}
