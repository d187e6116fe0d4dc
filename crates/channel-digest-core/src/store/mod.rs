//! Storage gateway for Channel Digest.
//!
//! The [`Store`] trait is the only way the engines touch durable state:
//! raw messages and their claim markers, items, embeddings, clusters,
//! digests, the summary cache and advisory locks. Implementations:
//!
//! - [`memory::InMemoryStore`]: `RwLock`-guarded maps, for tests.
//! - `SqliteStore` in the `channel-digest` crate: the production backend.
//!
//! # Concurrency contract
//!
//! Every operation is atomic at the granularity of its logical effect.
//! [`claim_pending_batch`](Store::claim_pending_batch) hands disjoint row
//! sets to concurrent callers. Upserts are keyed on:
//!
//! | Table | Conflict target |
//! |-------|-----------------|
//! | raw messages | `(channel, source_message_id)` |
//! | items | `raw_message_id` |
//! | embeddings | `item_id` |
//! | cluster members | `(cluster_id, item_id)` |
//! | digests | `(window_start, window_end)` |
//!
//! Operations that depend on the clock take `now` explicitly.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::models::{
    Claim, ClusterDraft, ClusterMembership, Digest, DigestEntry, DuplicateRef, Item,
    ItemErrorRecord, ItemRef, NewItem, NewRawMessage, PendingEmbedding, PipelineCounts,
    RawMessage, SummaryCacheEntry, Window, WindowItem,
};
use crate::retry::RetryPolicy;

/// Parameters for a nearest-neighbour lookup.
#[derive(Debug, Clone)]
pub struct SimilarityQuery<'a> {
    pub vector: &'a [f32],
    /// Cosine-similarity threshold in `[0, 1]`; matches must exceed it.
    pub threshold: f32,
    /// Only embeddings created strictly after this instant are considered.
    pub since: DateTime<Utc>,
    /// Restrict the search to one source channel.
    pub channel: Option<&'a str>,
    /// Item to leave out (usually the one being deduplicated).
    pub exclude_item_id: Option<i64>,
}

/// Nearest neighbour returned by a similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarMatch {
    pub item_id: i64,
    pub similarity: f32,
    pub first_seen_at: DateTime<Utc>,
    /// Set when the matched item is itself a duplicate; points at its canonical.
    pub duplicate_of_item_id: Option<i64>,
    pub digested: bool,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | Ingestion | [`upsert_raw_message`](Store::upsert_raw_message), [`get_raw_message`](Store::get_raw_message) |
/// | Claims | [`claim_pending_batch`](Store::claim_pending_batch), [`release_claim`](Store::release_claim), [`mark_processed`](Store::mark_processed), [`recover_stuck_claims`](Store::recover_stuck_claims), [`requeue_failed`](Store::requeue_failed) |
/// | Items | [`save_item`](Store::save_item), [`save_item_error`](Store::save_item_error), [`find_strict_duplicate`](Store::find_strict_duplicate), [`mark_duplicate`](Store::mark_duplicate) |
/// | Vectors | [`save_embedding`](Store::save_embedding), [`find_similar_item`](Store::find_similar_item) |
/// | Clusters | [`delete_clusters_for_window`](Store::delete_clusters_for_window), [`create_cluster`](Store::create_cluster), [`add_to_cluster`](Store::add_to_cluster), [`replace_window_clusters`](Store::replace_window_clusters) |
/// | Digests | [`digest_exists`](Store::digest_exists), [`save_digest`](Store::save_digest), [`save_digest_entries`](Store::save_digest_entries), [`save_digest_error`](Store::save_digest_error), [`record_published_digest`](Store::record_published_digest) |
/// | Locks | [`try_acquire_lock`](Store::try_acquire_lock), [`release_lock`](Store::release_lock) |
#[async_trait]
pub trait Store: Send + Sync {
    // ── Ingestion ──────────────────────────────────────────────────────

    /// Insert or update a raw message keyed on `(channel, source_message_id)`.
    ///
    /// Returns the row id. Claim and processing markers of an existing row
    /// are left untouched.
    async fn upsert_raw_message(&self, msg: &NewRawMessage) -> Result<i64>;

    async fn get_raw_message(&self, id: i64) -> Result<Option<RawMessage>>;

    // ── Claims ─────────────────────────────────────────────────────────

    /// Atomically claim up to `limit` eligible raw messages, oldest source
    /// date first, setting `processing_started_at = now`.
    ///
    /// Eligible: unclaimed and unprocessed, and either without an item, with
    /// an item in `error`/`retry` whose `retry_count < max_retries` and
    /// `next_retry_at <= now`, or with a `ready`/`digested` item left behind
    /// by an attempt that never reached `mark_processed`. Items in `error`
    /// move to `retry`.
    async fn claim_pending_batch(
        &self,
        limit: usize,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>>;

    /// Clear the claim marker so the row can be claimed again. Idempotent.
    async fn release_claim(&self, raw_message_id: i64) -> Result<()>;

    /// Set `processed_at = now` and clear the claim marker. Idempotent.
    async fn mark_processed(&self, raw_message_id: i64, now: DateTime<Utc>) -> Result<()>;

    /// Clear claims older than `stale_after` on unprocessed rows.
    async fn recover_stuck_claims(&self, stale_after: Duration, now: DateTime<Utc>)
        -> Result<u64>;

    /// Operator retry: put a terminally failed message back in the queue.
    ///
    /// Returns `false` if the message has no item in `error`.
    async fn requeue_failed(&self, raw_message_id: i64, now: DateTime<Utc>) -> Result<bool>;

    // ── Items ──────────────────────────────────────────────────────────

    /// Upsert a successful enrichment as a `ready` item, keyed on
    /// `raw_message_id`. Preserves `retry_count`. Returns the item id.
    async fn save_item(&self, item: &NewItem) -> Result<i64>;

    /// Record an enrichment failure: upsert an `error` item, increment its
    /// `retry_count` and schedule `next_retry_at` per `policy`.
    async fn save_item_error(
        &self,
        raw_message_id: i64,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ItemErrorRecord>;

    async fn get_item(&self, id: i64) -> Result<Option<Item>>;

    async fn get_item_by_raw_message(&self, raw_message_id: i64) -> Result<Option<Item>>;

    /// The earliest item, other than the one for `exclude_raw_message_id`,
    /// whose message has `canonical_hash`, has been processed, and whose
    /// item is not in `error`.
    async fn find_strict_duplicate(
        &self,
        canonical_hash: &str,
        exclude_raw_message_id: i64,
    ) -> Result<Option<ItemRef>>;

    /// Whether a strict duplicate exists for `canonical_hash`.
    async fn strict_duplicate(
        &self,
        canonical_hash: &str,
        exclude_raw_message_id: i64,
    ) -> Result<bool> {
        Ok(self
            .find_strict_duplicate(canonical_hash, exclude_raw_message_id)
            .await?
            .is_some())
    }

    /// Point `item_id` at `canonical_item_id`.
    ///
    /// If the canonical is itself a duplicate, its own canonical is used.
    /// Items already pointing at `item_id` are re-pointed, so links never
    /// chain. Returns the canonical id actually stored.
    async fn mark_duplicate(&self, item_id: i64, canonical_item_id: i64) -> Result<i64>;

    /// Terminally failed items (status `error`, message processed), newest first.
    async fn list_failed_items(&self, limit: usize) -> Result<Vec<Item>>;

    // ── Embeddings ─────────────────────────────────────────────────────

    /// Upsert an item's vector keyed on `item_id`.
    async fn save_embedding(&self, item_id: i64, vector: &[f32], now: DateTime<Utc>)
        -> Result<()>;

    async fn get_embedding(&self, item_id: i64) -> Result<Option<Vec<f32>>>;

    /// Ready, non-duplicate items with `relevance_score >= min_relevance`
    /// that have no embedding yet.
    async fn items_missing_embeddings(
        &self,
        min_relevance: f64,
        limit: usize,
    ) -> Result<Vec<PendingEmbedding>>;

    /// Nearest neighbour above `query.threshold`, or `None`.
    async fn find_similar_item(&self, query: &SimilarityQuery<'_>) -> Result<Option<SimilarMatch>>;

    // ── Window reads ───────────────────────────────────────────────────

    /// Digest-eligible items in `window`: status `ready`, not digested, not a
    /// duplicate, `importance_score >= importance_threshold`. Ordered by
    /// importance descending, then `first_seen_at`, then id; at most `limit`.
    async fn load_window_items(
        &self,
        window: &Window,
        importance_threshold: f64,
        limit: usize,
    ) -> Result<Vec<WindowItem>>;

    /// Undigested duplicates pointing at any of `canonical_ids`.
    async fn load_duplicates_of(&self, canonical_ids: &[i64]) -> Result<Vec<DuplicateRef>>;

    // ── Clusters ───────────────────────────────────────────────────────

    async fn delete_clusters_for_window(&self, window: &Window) -> Result<u64>;

    async fn create_cluster(
        &self,
        window: &Window,
        topic: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64>;

    /// Add an item to a cluster. Idempotent on `(cluster_id, item_id)`.
    async fn add_to_cluster(&self, cluster_id: i64, item_id: i64) -> Result<()>;

    /// Delete the window's clusters and insert `clusters`, atomically.
    async fn replace_window_clusters(
        &self,
        window: &Window,
        clusters: &[ClusterDraft],
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>>;

    async fn load_window_clusters(&self, window: &Window) -> Result<Vec<ClusterMembership>>;

    // ── Digests ────────────────────────────────────────────────────────

    /// True if a posted digest exists for `window`, or a failed attempt
    /// younger than `grace`.
    async fn digest_exists(
        &self,
        window: &Window,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record a posted digest, replacing an `error` row for the window.
    /// If the window is already posted, returns the existing id unchanged.
    async fn save_digest(
        &self,
        window: &Window,
        chat_id: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64>;

    /// Replace the entries of a digest.
    async fn save_digest_entries(&self, digest_id: i64, entries: &[DigestEntry]) -> Result<()>;

    /// Record a failed publication. Never overwrites a posted digest.
    async fn save_digest_error(
        &self,
        window: &Window,
        chat_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Delete all `error` digest rows. Returns how many were removed.
    async fn clear_digest_errors(&self) -> Result<u64>;

    /// Move `ready` items to `digested`. Returns how many changed.
    async fn mark_items_digested(&self, item_ids: &[i64], now: DateTime<Utc>) -> Result<u64>;

    /// `save_digest` + `save_digest_entries` + `mark_items_digested` in one
    /// transaction.
    async fn record_published_digest(
        &self,
        window: &Window,
        chat_id: &str,
        message_id: &str,
        entries: &[DigestEntry],
        now: DateTime<Utc>,
    ) -> Result<i64>;

    async fn get_digest(&self, window: &Window) -> Result<Option<Digest>>;

    async fn get_digest_entries(&self, digest_id: i64) -> Result<Vec<DigestEntry>>;

    // ── Summary cache ──────────────────────────────────────────────────

    async fn get_summary(
        &self,
        canonical_hash: &str,
        digest_language: &str,
    ) -> Result<Option<SummaryCacheEntry>>;

    /// Last write wins.
    async fn upsert_summary(&self, entry: &SummaryCacheEntry, now: DateTime<Utc>) -> Result<()>;

    // ── Drop log ───────────────────────────────────────────────────────

    async fn record_dropped(&self, raw_message_id: i64, reason: &str, now: DateTime<Utc>)
        -> Result<()>;

    // ── Advisory locks ─────────────────────────────────────────────────

    /// Take lock `lock_id`. A lock held longer than `ttl` is considered
    /// abandoned and may be taken over.
    async fn try_acquire_lock(&self, lock_id: i64, ttl: Duration, now: DateTime<Utc>)
        -> Result<bool>;

    /// Release lock `lock_id` if it is still held under `acquired_at`, the
    /// `now` the holder passed to [`try_acquire_lock`](Store::try_acquire_lock).
    /// A lock taken over after the TTL is left to its new holder.
    async fn release_lock(&self, lock_id: i64, acquired_at: DateTime<Utc>) -> Result<()>;

    // ── Reporting ──────────────────────────────────────────────────────

    async fn pipeline_counts(&self) -> Result<PipelineCounts>;
}
