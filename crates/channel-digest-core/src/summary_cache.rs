//! Content-addressed memo of enrichment outputs.
//!
//! Entries are keyed by `(canonical_hash, digest_language)` and hold the
//! provider's outputs, never embeddings. A hit lets the worker skip the
//! enrichment call for a message whose normalized text was already seen.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::CacheError;
use crate::models::{Enrichment, SummaryCacheEntry};
use crate::store::Store;

pub struct SummaryCache {
    store: Arc<dyn Store>,
}

impl SummaryCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Look up an entry. Absence is [`CacheError::NotFound`].
    pub async fn get(
        &self,
        canonical_hash: &str,
        digest_language: &str,
    ) -> Result<SummaryCacheEntry, CacheError> {
        self.store
            .get_summary(canonical_hash, digest_language)
            .await?
            .ok_or(CacheError::NotFound)
    }

    /// Cached enrichment, or `None` on a miss.
    pub async fn lookup(
        &self,
        canonical_hash: &str,
        digest_language: &str,
    ) -> Result<Option<Enrichment>, CacheError> {
        match self.get(canonical_hash, digest_language).await {
            Ok(entry) => Ok(Some(entry.to_enrichment())),
            Err(CacheError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Insert or replace an entry. Last write wins.
    pub async fn upsert(&self, entry: &SummaryCacheEntry, now: DateTime<Utc>) -> Result<(), CacheError> {
        self.store.upsert_summary(entry, now).await?;
        Ok(())
    }

    pub async fn remember(
        &self,
        canonical_hash: &str,
        digest_language: &str,
        enrichment: &Enrichment,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let entry = SummaryCacheEntry::from_enrichment(canonical_hash, digest_language, enrichment);
        self.upsert(&entry, now).await
    }
}
