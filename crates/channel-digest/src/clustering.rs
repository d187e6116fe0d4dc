//! Clustering engine: rebuilds a window's clusters from its ready items.
//!
//! Loads the digest-eligible items of the window, links them with
//! [`plan_clusters`] and swaps the window's clusters in one transaction,
//! so readers see either the old set or the new one.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use channel_digest_core::cluster::{plan_clusters, ClusterParams};
use channel_digest_core::error::{PipelineError, PipelineResult};
use channel_digest_core::models::Window;
use channel_digest_core::store::Store;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterReport {
    /// Eligible items loaded for the window.
    pub items: usize,
    /// Items that took part in clustering (those with an embedding).
    pub embedded_items: usize,
    pub clusters: usize,
    pub largest: usize,
}

pub struct ClusteringEngine {
    store: Arc<dyn Store>,
    params: ClusterParams,
    importance_threshold: f64,
}

impl ClusteringEngine {
    pub fn new(store: Arc<dyn Store>, params: ClusterParams, importance_threshold: f64) -> Self {
        Self {
            store,
            params,
            importance_threshold,
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &Config) -> Self {
        Self::new(
            store,
            config.cluster_params(),
            config.digest.importance_threshold,
        )
    }

    pub async fn rebuild(
        &self,
        window: &Window,
        cancel: &CancellationToken,
    ) -> PipelineResult<ClusterReport> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let items = self
            .store
            .load_window_items(window, self.importance_threshold, self.params.max_items)
            .await?;
        let drafts = plan_clusters(&items, &self.params);

        // Last point to back out before the rebuild becomes visible.
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.store
            .replace_window_clusters(window, &drafts, Utc::now())
            .await?;

        let report = ClusterReport {
            items: items.len(),
            embedded_items: items.iter().filter(|i| i.embedding.is_some()).count(),
            clusters: drafts.len(),
            largest: drafts.iter().map(|d| d.item_ids.len()).max().unwrap_or(0),
        };
        tracing::info!(
            window = %window,
            items = report.items,
            clusters = report.clusters,
            largest = report.largest,
            "clusters rebuilt"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel_digest_core::models::{NewItem, NewRawMessage};
    use channel_digest_core::store::memory::InMemoryStore;
    use chrono::{Duration, TimeZone};

    async fn ready_item(
        store: &InMemoryStore,
        msg_id: i64,
        minutes: i64,
        importance: f64,
        vector: Option<Vec<f32>>,
    ) -> i64 {
        let seen = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes);
        let raw = store
            .upsert_raw_message(&NewRawMessage::new("@c", msg_id, seen, format!("text {}", msg_id)))
            .await
            .unwrap();
        let item_id = store
            .save_item(&NewItem {
                raw_message_id: raw,
                relevance_score: 0.9,
                importance_score: importance,
                topic: "topic".into(),
                summary: format!("summary {}", msg_id),
                language: "en".into(),
                first_seen_at: seen,
            })
            .await
            .unwrap();
        if let Some(v) = vector {
            store.save_embedding(item_id, &v, seen).await.unwrap();
        }
        item_id
    }

    fn window() -> Window {
        let start = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        Window::new(start, start + Duration::hours(1)).unwrap()
    }

    #[tokio::test]
    async fn test_rebuild_replaces_clusters() {
        let store = Arc::new(InMemoryStore::new());
        let a = ready_item(&store, 1, 1, 0.9, Some(vec![1.0, 0.0])).await;
        let b = ready_item(&store, 2, 2, 0.8, Some(vec![0.99, 0.05])).await;
        let c = ready_item(&store, 3, 3, 0.7, Some(vec![0.0, 1.0])).await;
        ready_item(&store, 4, 4, 0.6, None).await;
        // Outside the window
        ready_item(&store, 5, 90, 0.9, Some(vec![1.0, 0.0])).await;

        let engine = ClusteringEngine::new(store.clone(), ClusterParams::default(), 0.5);
        let cancel = CancellationToken::new();
        let report = engine.rebuild(&window(), &cancel).await.unwrap();
        assert_eq!(report.items, 4);
        assert_eq!(report.embedded_items, 3);
        assert_eq!(report.clusters, 2);
        assert_eq!(report.largest, 2);

        // Idempotent: a second run leaves the same membership.
        engine.rebuild(&window(), &cancel).await.unwrap();
        let clusters = store.load_window_clusters(&window()).await.unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].item_ids, vec![a, b]);
        assert_eq!(clusters[1].item_ids, vec![c]);
    }

    #[tokio::test]
    async fn test_cancelled_rebuild_keeps_old_clusters() {
        let store = Arc::new(InMemoryStore::new());
        ready_item(&store, 1, 1, 0.9, Some(vec![1.0, 0.0])).await;
        let engine = ClusteringEngine::new(store.clone(), ClusterParams::default(), 0.5);
        engine
            .rebuild(&window(), &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            engine.rebuild(&window(), &cancel).await,
            Err(PipelineError::Cancelled)
        ));
        assert_eq!(store.load_window_clusters(&window()).await.unwrap().len(), 1);
    }
}
