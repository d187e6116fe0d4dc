//! Similarity index over item embeddings.
//!
//! A thin layer over [`Store::find_similar_item`] with two scopes:
//!
//! | Scope | Threshold | Time floor |
//! |-------|-----------|------------|
//! | cross-channel | coarse (`global_similarity`) | long (`global_window`) |
//! | in-channel | finer (`intra_similarity`) | short (`intra_window`) |
//!
//! The index re-checks every match it returns: nothing with similarity
//! `<= threshold` ever leaves this module.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::embedding::exceeds_threshold;
use crate::store::{SimilarMatch, SimilarityQuery, Store};

/// Pick the nearest candidate above `threshold`.
///
/// Higher similarity wins; ties go to the earlier `first_seen_at`, then the
/// lower item id. Store implementations use this to reduce a scan.
pub fn best_match<I>(candidates: I, threshold: f32) -> Option<SimilarMatch>
where
    I: IntoIterator<Item = SimilarMatch>,
{
    candidates
        .into_iter()
        .filter(|c| exceeds_threshold(c.similarity, threshold))
        .min_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then(a.first_seen_at.cmp(&b.first_seen_at))
                .then(a.item_id.cmp(&b.item_id))
        })
}

pub struct SimilarityIndex {
    store: Arc<dyn Store>,
}

impl SimilarityIndex {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Nearest item across all channels created after `since`.
    pub async fn find_similar(
        &self,
        vector: &[f32],
        threshold: f32,
        since: DateTime<Utc>,
        exclude_item_id: Option<i64>,
    ) -> Result<Option<SimilarMatch>> {
        self.search(SimilarityQuery {
            vector,
            threshold,
            since,
            channel: None,
            exclude_item_id,
        })
        .await
    }

    /// Nearest item from `channel` created after `since`.
    pub async fn find_similar_in_channel(
        &self,
        vector: &[f32],
        channel: &str,
        threshold: f32,
        since: DateTime<Utc>,
        exclude_item_id: Option<i64>,
    ) -> Result<Option<SimilarMatch>> {
        self.search(SimilarityQuery {
            vector,
            threshold,
            since,
            channel: Some(channel),
            exclude_item_id,
        })
        .await
    }

    async fn search(&self, query: SimilarityQuery<'_>) -> Result<Option<SimilarMatch>> {
        if query.vector.is_empty() {
            return Ok(None);
        }
        let found = self.store.find_similar_item(&query).await?;
        Ok(found.filter(|m| exceeds_threshold(m.similarity, query.threshold)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewItem, NewRawMessage};
    use crate::store::memory::InMemoryStore;
    use chrono::{Duration, TimeZone};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn candidate(item_id: i64, similarity: f32, seen: i64) -> SimilarMatch {
        SimilarMatch {
            item_id,
            similarity,
            first_seen_at: ts(seen),
            duplicate_of_item_id: None,
            digested: false,
        }
    }

    async fn seed(store: &InMemoryStore, channel: &str, msg_id: i64, vector: &[f32], at: i64) -> i64 {
        let raw = store
            .upsert_raw_message(&NewRawMessage::new(channel, msg_id, ts(at), format!("m{msg_id}")))
            .await
            .unwrap();
        let item = store
            .save_item(&NewItem {
                raw_message_id: raw,
                relevance_score: 0.9,
                importance_score: 0.9,
                topic: "t".into(),
                summary: "s".into(),
                language: "en".into(),
                first_seen_at: ts(at),
            })
            .await
            .unwrap();
        store.save_embedding(item, vector, ts(at)).await.unwrap();
        item
    }

    #[test]
    fn test_best_match_prefers_similarity_then_age() {
        let best = best_match(
            vec![candidate(1, 0.95, 10), candidate(2, 0.97, 20), candidate(3, 0.97, 5)],
            0.9,
        )
        .unwrap();
        assert_eq!(best.item_id, 3);
    }

    #[test]
    fn test_best_match_respects_threshold() {
        assert!(best_match(vec![candidate(1, 0.9, 0)], 0.9).is_none());
    }

    #[tokio::test]
    async fn test_channel_scope_and_time_floor() {
        let store = Arc::new(InMemoryStore::new());
        let a = seed(&store, "@a", 1, &[1.0, 0.0], 1_000).await;
        let _b = seed(&store, "@b", 1, &[1.0, 0.0], 2_000).await;
        let index = SimilarityIndex::new(store.clone());

        let global = index
            .find_similar(&[1.0, 0.0], 0.9, ts(0), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(global.item_id, a);

        let scoped = index
            .find_similar_in_channel(&[1.0, 0.0], "@b", 0.9, ts(0), None)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(scoped.item_id, a);

        let recent = index
            .find_similar(&[1.0, 0.0], 0.9, ts(1_500), None)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(recent.item_id, a);

        let none = index
            .find_similar(&[1.0, 0.0], 0.9, ts(2_000) + Duration::seconds(1), None)
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_threshold_one_requires_identical_vector() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "@a", 1, &[0.6, 0.8], 100).await;
        let index = SimilarityIndex::new(store.clone());

        assert!(index
            .find_similar(&[0.6, 0.8], 1.0, ts(0), None)
            .await
            .unwrap()
            .is_some());
        assert!(index
            .find_similar(&[0.6, 0.81], 1.0, ts(0), None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_empty_vector_never_matches() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "@a", 1, &[1.0], 100).await;
        let index = SimilarityIndex::new(store);
        assert!(index.find_similar(&[], 0.0, ts(0), None).await.unwrap().is_none());
    }
}
