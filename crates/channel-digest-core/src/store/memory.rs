//! In-memory [`Store`] implementation for tests.
//!
//! All state sits behind a single `RwLock`, so every operation is trivially
//! atomic and concurrent claimers always see disjoint batches. Vector search
//! is a brute-force cosine scan.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::embedding::cosine_similarity;
use crate::models::{
    Claim, ClusterDraft, ClusterMembership, Digest, DigestEntry, DigestStatus, DuplicateRef,
    Item, ItemErrorRecord, ItemRef, ItemStatus, NewItem, NewRawMessage, PendingEmbedding,
    PipelineCounts, RawMessage, SummaryCacheEntry, Window, WindowItem,
};
use crate::retry::RetryPolicy;
use crate::similarity::best_match;

use super::{SimilarMatch, SimilarityQuery, Store};

struct StoredVector {
    vector: Vec<f32>,
    created_at: DateTime<Utc>,
}

struct StoredCluster {
    window: Window,
    topic: Option<String>,
    members: Vec<i64>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    raw: BTreeMap<i64, RawMessage>,
    raw_keys: HashMap<(String, i64), i64>,
    items: BTreeMap<i64, Item>,
    item_by_raw: HashMap<i64, i64>,
    vectors: HashMap<i64, StoredVector>,
    clusters: BTreeMap<i64, StoredCluster>,
    digests: BTreeMap<i64, Digest>,
    entries: HashMap<i64, Vec<DigestEntry>>,
    summaries: HashMap<(String, String), SummaryCacheEntry>,
    dropped: Vec<(i64, String, DateTime<Utc>)>,
    locks: HashMap<i64, DateTime<Utc>>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn canonical_root(&self, item_id: i64) -> i64 {
        self.items
            .get(&item_id)
            .and_then(|i| i.duplicate_of_item_id)
            .unwrap_or(item_id)
    }

    fn window_digest_id(&self, window: &Window) -> Option<i64> {
        self.digests
            .values()
            .find(|d| d.window == *window)
            .map(|d| d.id)
    }

    fn save_digest(
        &mut self,
        window: &Window,
        chat_id: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> i64 {
        if let Some(id) = self.window_digest_id(window) {
            if let Some(d) = self.digests.get_mut(&id) {
                if d.status == DigestStatus::Error {
                    d.status = DigestStatus::Posted;
                    d.chat_id = chat_id.to_string();
                    d.message_id = Some(message_id.to_string());
                    d.posted_at = Some(now);
                    d.error = None;
                }
            }
            return id;
        }
        let id = self.next_id();
        self.digests.insert(
            id,
            Digest {
                id,
                window: *window,
                chat_id: chat_id.to_string(),
                message_id: Some(message_id.to_string()),
                status: DigestStatus::Posted,
                posted_at: Some(now),
                error: None,
                created_at: now,
            },
        );
        id
    }

    fn mark_items_digested(&mut self, item_ids: &[i64], now: DateTime<Utc>) -> u64 {
        let mut changed = 0;
        for id in item_ids {
            if let Some(item) = self.items.get_mut(id) {
                if item.status == ItemStatus::Ready {
                    item.status = ItemStatus::Digested;
                    item.digested_at = Some(now);
                    changed += 1;
                }
            }
        }
        changed
    }

    fn delete_clusters_for_window(&mut self, window: &Window) -> u64 {
        let before = self.clusters.len();
        self.clusters.retain(|_, c| c.window != *window);
        (before - self.clusters.len()) as u64
    }
}

/// In-memory store for tests.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    /// Number of drop-log rows, for assertions.
    pub fn dropped_count(&self) -> usize {
        self.read().map(|s| s.dropped.len()).unwrap_or(0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_raw_message(&self, msg: &NewRawMessage) -> Result<i64> {
        let mut s = self.write()?;
        let key = (msg.channel.clone(), msg.source_message_id);
        if let Some(&id) = s.raw_keys.get(&key) {
            if let Some(row) = s.raw.get_mut(&id) {
                row.source_date = msg.source_date;
                row.text = msg.text.clone();
                row.entities_json = msg.entities_json.clone();
                row.media_json = msg.media_json.clone();
                row.forwarded_from = msg.forwarded_from.clone();
                row.canonical_hash = msg.canonical_hash.clone();
            }
            return Ok(id);
        }
        let id = s.next_id();
        s.raw.insert(
            id,
            RawMessage {
                id,
                channel: msg.channel.clone(),
                source_message_id: msg.source_message_id,
                source_date: msg.source_date,
                text: msg.text.clone(),
                entities_json: msg.entities_json.clone(),
                media_json: msg.media_json.clone(),
                forwarded_from: msg.forwarded_from.clone(),
                canonical_hash: msg.canonical_hash.clone(),
                processed_at: None,
                processing_started_at: None,
                discoveries_extracted: false,
            },
        );
        s.raw_keys.insert(key, id);
        Ok(id)
    }

    async fn get_raw_message(&self, id: i64) -> Result<Option<RawMessage>> {
        Ok(self.read()?.raw.get(&id).cloned())
    }

    async fn claim_pending_batch(
        &self,
        limit: usize,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>> {
        let mut s = self.write()?;
        let mut eligible: Vec<(DateTime<Utc>, i64)> = s
            .raw
            .values()
            .filter(|m| m.processing_started_at.is_none() && m.processed_at.is_none())
            .filter(|m| match s.item_by_raw.get(&m.id).and_then(|i| s.items.get(i)) {
                None => true,
                Some(item) => match item.status {
                    ItemStatus::Ready | ItemStatus::Digested => true,
                    ItemStatus::Error | ItemStatus::Retry => {
                        item.retry_count < max_retries
                            && item.next_retry_at.map_or(true, |t| t <= now)
                    }
                },
            })
            .map(|m| (m.source_date, m.id))
            .collect();
        eligible.sort();
        eligible.truncate(limit);

        let mut claims = Vec::with_capacity(eligible.len());
        for (_, raw_id) in eligible {
            let item_id = s.item_by_raw.get(&raw_id).copied();
            let mut retry_count = 0;
            let mut item_status = None;
            if let Some(item) = item_id.and_then(|id| s.items.get_mut(&id)) {
                if item.status == ItemStatus::Error {
                    item.status = ItemStatus::Retry;
                }
                retry_count = item.retry_count;
                item_status = Some(item.status);
            }
            if let Some(row) = s.raw.get_mut(&raw_id) {
                row.processing_started_at = Some(now);
                claims.push(Claim {
                    message: row.clone(),
                    item_id,
                    item_status,
                    retry_count,
                });
            }
        }
        Ok(claims)
    }

    async fn release_claim(&self, raw_message_id: i64) -> Result<()> {
        let mut s = self.write()?;
        if let Some(row) = s.raw.get_mut(&raw_message_id) {
            row.processing_started_at = None;
        }
        Ok(())
    }

    async fn mark_processed(&self, raw_message_id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut s = self.write()?;
        if let Some(row) = s.raw.get_mut(&raw_message_id) {
            if row.processed_at.is_none() {
                row.processed_at = Some(now);
            }
            row.processing_started_at = None;
        }
        Ok(())
    }

    async fn recover_stuck_claims(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut s = self.write()?;
        let horizon = now - stale_after;
        let mut recovered = 0;
        for row in s.raw.values_mut() {
            if row.processed_at.is_none()
                && row.processing_started_at.is_some_and(|t| t <= horizon)
            {
                row.processing_started_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn requeue_failed(&self, raw_message_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut s = self.write()?;
        let Some(item_id) = s.item_by_raw.get(&raw_message_id).copied() else {
            return Ok(false);
        };
        let Some(item) = s.items.get_mut(&item_id) else {
            return Ok(false);
        };
        if item.status != ItemStatus::Error {
            return Ok(false);
        }
        item.status = ItemStatus::Retry;
        item.retry_count = 0;
        item.next_retry_at = Some(now);
        if let Some(row) = s.raw.get_mut(&raw_message_id) {
            row.processed_at = None;
            row.processing_started_at = None;
        }
        Ok(true)
    }

    async fn save_item(&self, new: &NewItem) -> Result<i64> {
        let mut s = self.write()?;
        if let Some(&id) = s.item_by_raw.get(&new.raw_message_id) {
            if let Some(item) = s.items.get_mut(&id) {
                item.relevance_score = new.relevance_score;
                item.importance_score = new.importance_score;
                item.topic = new.topic.clone();
                item.summary = new.summary.clone();
                item.language = new.language.clone();
                if item.status != ItemStatus::Digested {
                    item.status = ItemStatus::Ready;
                }
                item.next_retry_at = None;
                item.error = None;
            }
            return Ok(id);
        }
        let raw = s
            .raw
            .get(&new.raw_message_id)
            .cloned()
            .ok_or_else(|| anyhow!("raw message {} not found", new.raw_message_id))?;
        let id = s.next_id();
        s.items.insert(
            id,
            Item {
                id,
                raw_message_id: raw.id,
                channel: raw.channel,
                source_message_id: raw.source_message_id,
                canonical_hash: raw.canonical_hash,
                relevance_score: new.relevance_score,
                importance_score: new.importance_score,
                topic: new.topic.clone(),
                summary: new.summary.clone(),
                language: new.language.clone(),
                status: ItemStatus::Ready,
                retry_count: 0,
                next_retry_at: None,
                first_seen_at: new.first_seen_at,
                digested_at: None,
                error: None,
                duplicate_of_item_id: None,
            },
        );
        s.item_by_raw.insert(new.raw_message_id, id);
        Ok(id)
    }

    async fn save_item_error(
        &self,
        raw_message_id: i64,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ItemErrorRecord> {
        let mut s = self.write()?;
        let item_id = match s.item_by_raw.get(&raw_message_id).copied() {
            Some(id) => id,
            None => {
                let raw = s
                    .raw
                    .get(&raw_message_id)
                    .cloned()
                    .ok_or_else(|| anyhow!("raw message {} not found", raw_message_id))?;
                let id = s.next_id();
                s.items.insert(
                    id,
                    Item {
                        id,
                        raw_message_id,
                        channel: raw.channel,
                        source_message_id: raw.source_message_id,
                        canonical_hash: raw.canonical_hash,
                        relevance_score: 0.0,
                        importance_score: 0.0,
                        topic: String::new(),
                        summary: String::new(),
                        language: String::new(),
                        status: ItemStatus::Error,
                        retry_count: 0,
                        next_retry_at: None,
                        first_seen_at: raw.source_date,
                        digested_at: None,
                        error: None,
                        duplicate_of_item_id: None,
                    },
                );
                s.item_by_raw.insert(raw_message_id, id);
                id
            }
        };
        let item = s
            .items
            .get_mut(&item_id)
            .ok_or_else(|| anyhow!("item {} vanished", item_id))?;
        item.retry_count += 1;
        item.status = ItemStatus::Error;
        item.error = Some(error.to_string());
        let next_retry_at = policy.next_retry_at(item.retry_count, now);
        item.next_retry_at = Some(next_retry_at);
        Ok(ItemErrorRecord {
            item_id,
            retry_count: item.retry_count,
            next_retry_at,
            exhausted: policy.is_exhausted(item.retry_count),
        })
    }

    async fn get_item(&self, id: i64) -> Result<Option<Item>> {
        Ok(self.read()?.items.get(&id).cloned())
    }

    async fn get_item_by_raw_message(&self, raw_message_id: i64) -> Result<Option<Item>> {
        let s = self.read()?;
        Ok(s.item_by_raw
            .get(&raw_message_id)
            .and_then(|id| s.items.get(id))
            .cloned())
    }

    async fn find_strict_duplicate(
        &self,
        canonical_hash: &str,
        exclude_raw_message_id: i64,
    ) -> Result<Option<ItemRef>> {
        let s = self.read()?;
        let found = s
            .raw
            .values()
            .filter(|m| {
                m.id != exclude_raw_message_id
                    && m.canonical_hash == canonical_hash
                    && m.processed_at.is_some()
            })
            .filter_map(|m| s.item_by_raw.get(&m.id).and_then(|id| s.items.get(id)))
            .filter(|i| matches!(i.status, ItemStatus::Ready | ItemStatus::Digested))
            .min_by_key(|i| (i.first_seen_at, i.id))
            .map(|i| ItemRef {
                item_id: i.id,
                first_seen_at: i.first_seen_at,
                status: i.status,
            });
        Ok(found)
    }

    async fn mark_duplicate(&self, item_id: i64, canonical_item_id: i64) -> Result<i64> {
        let mut s = self.write()?;
        if !s.items.contains_key(&item_id) {
            bail!("item {} not found", item_id);
        }
        if !s.items.contains_key(&canonical_item_id) {
            bail!("canonical item {} not found", canonical_item_id);
        }
        let root = s.canonical_root(canonical_item_id);
        if root == item_id {
            bail!("item {} cannot be a duplicate of itself", item_id);
        }
        for item in s.items.values_mut() {
            if item.id == item_id || item.duplicate_of_item_id == Some(item_id) {
                item.duplicate_of_item_id = Some(root);
            }
        }
        Ok(root)
    }

    async fn list_failed_items(&self, limit: usize) -> Result<Vec<Item>> {
        let s = self.read()?;
        Ok(s.items
            .values()
            .rev()
            .filter(|i| i.status == ItemStatus::Error)
            .filter(|i| {
                s.raw
                    .get(&i.raw_message_id)
                    .is_some_and(|m| m.processed_at.is_some())
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_embedding(
        &self,
        item_id: i64,
        vector: &[f32],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut s = self.write()?;
        if !s.items.contains_key(&item_id) {
            bail!("item {} not found", item_id);
        }
        s.vectors.insert(
            item_id,
            StoredVector {
                vector: vector.to_vec(),
                created_at: now,
            },
        );
        Ok(())
    }

    async fn get_embedding(&self, item_id: i64) -> Result<Option<Vec<f32>>> {
        Ok(self.read()?.vectors.get(&item_id).map(|v| v.vector.clone()))
    }

    async fn items_missing_embeddings(
        &self,
        min_relevance: f64,
        limit: usize,
    ) -> Result<Vec<PendingEmbedding>> {
        let s = self.read()?;
        Ok(s.items
            .values()
            .filter(|i| {
                i.status == ItemStatus::Ready
                    && i.duplicate_of_item_id.is_none()
                    && i.relevance_score >= min_relevance
                    && !s.vectors.contains_key(&i.id)
            })
            .take(limit)
            .map(|i| PendingEmbedding {
                item_id: i.id,
                text: if i.summary.is_empty() {
                    s.raw
                        .get(&i.raw_message_id)
                        .map(|m| m.text.clone())
                        .unwrap_or_default()
                } else {
                    i.summary.clone()
                },
            })
            .collect())
    }

    async fn find_similar_item(&self, query: &SimilarityQuery<'_>) -> Result<Option<SimilarMatch>> {
        let s = self.read()?;
        let candidates = s.vectors.iter().filter_map(|(item_id, stored)| {
            if stored.created_at <= query.since || Some(*item_id) == query.exclude_item_id {
                return None;
            }
            let item = s.items.get(item_id)?;
            if !matches!(item.status, ItemStatus::Ready | ItemStatus::Digested) {
                return None;
            }
            if query.channel.is_some_and(|c| c != item.channel) {
                return None;
            }
            Some(SimilarMatch {
                item_id: item.id,
                similarity: cosine_similarity(query.vector, &stored.vector),
                first_seen_at: item.first_seen_at,
                duplicate_of_item_id: item.duplicate_of_item_id,
                digested: item.status == ItemStatus::Digested,
            })
        });
        Ok(best_match(candidates, query.threshold))
    }

    async fn load_window_items(
        &self,
        window: &Window,
        importance_threshold: f64,
        limit: usize,
    ) -> Result<Vec<WindowItem>> {
        let s = self.read()?;
        let mut items: Vec<&Item> = s
            .items
            .values()
            .filter(|i| {
                i.status == ItemStatus::Ready
                    && i.digested_at.is_none()
                    && i.duplicate_of_item_id.is_none()
                    && i.importance_score >= importance_threshold
                    && window.contains(i.first_seen_at)
            })
            .collect();
        items.sort_by(|a, b| {
            b.importance_score
                .partial_cmp(&a.importance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.first_seen_at.cmp(&b.first_seen_at))
                .then(a.id.cmp(&b.id))
        });
        items.truncate(limit);
        Ok(items
            .into_iter()
            .map(|i| WindowItem {
                item_id: i.id,
                channel: i.channel.clone(),
                source_message_id: i.source_message_id,
                topic: i.topic.clone(),
                summary: i.summary.clone(),
                importance_score: i.importance_score,
                first_seen_at: i.first_seen_at,
                embedding: s.vectors.get(&i.id).map(|v| v.vector.clone()),
            })
            .collect())
    }

    async fn load_duplicates_of(&self, canonical_ids: &[i64]) -> Result<Vec<DuplicateRef>> {
        let s = self.read()?;
        let wanted: HashSet<i64> = canonical_ids.iter().copied().collect();
        Ok(s.items
            .values()
            .filter(|i| i.status == ItemStatus::Ready && i.digested_at.is_none())
            .filter_map(|i| {
                let canonical = i.duplicate_of_item_id?;
                wanted.contains(&canonical).then(|| DuplicateRef {
                    item_id: i.id,
                    duplicate_of_item_id: canonical,
                    channel: i.channel.clone(),
                    source_message_id: i.source_message_id,
                })
            })
            .collect())
    }

    async fn delete_clusters_for_window(&self, window: &Window) -> Result<u64> {
        Ok(self.write()?.delete_clusters_for_window(window))
    }

    async fn create_cluster(
        &self,
        window: &Window,
        topic: Option<&str>,
        _now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut s = self.write()?;
        let id = s.next_id();
        s.clusters.insert(
            id,
            StoredCluster {
                window: *window,
                topic: topic.map(str::to_string),
                members: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn add_to_cluster(&self, cluster_id: i64, item_id: i64) -> Result<()> {
        let mut s = self.write()?;
        let cluster = s
            .clusters
            .get_mut(&cluster_id)
            .ok_or_else(|| anyhow!("cluster {} not found", cluster_id))?;
        if !cluster.members.contains(&item_id) {
            cluster.members.push(item_id);
        }
        Ok(())
    }

    async fn replace_window_clusters(
        &self,
        window: &Window,
        clusters: &[ClusterDraft],
        _now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let mut s = self.write()?;
        s.delete_clusters_for_window(window);
        let mut ids = Vec::with_capacity(clusters.len());
        for draft in clusters {
            let id = s.next_id();
            let mut members: Vec<i64> = Vec::with_capacity(draft.item_ids.len());
            for item_id in &draft.item_ids {
                if !members.contains(item_id) {
                    members.push(*item_id);
                }
            }
            s.clusters.insert(
                id,
                StoredCluster {
                    window: *window,
                    topic: draft.topic.clone(),
                    members,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn load_window_clusters(&self, window: &Window) -> Result<Vec<ClusterMembership>> {
        let s = self.read()?;
        Ok(s.clusters
            .iter()
            .filter(|(_, c)| c.window == *window)
            .map(|(id, c)| ClusterMembership {
                cluster_id: *id,
                topic: c.topic.clone(),
                item_ids: c.members.clone(),
            })
            .collect())
    }

    async fn digest_exists(
        &self,
        window: &Window,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let s = self.read()?;
        Ok(s.digests.values().any(|d| {
            d.window == *window
                && match d.status {
                    DigestStatus::Posted => true,
                    DigestStatus::Error => d.created_at > now - grace,
                }
        }))
    }

    async fn save_digest(
        &self,
        window: &Window,
        chat_id: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(self.write()?.save_digest(window, chat_id, message_id, now))
    }

    async fn save_digest_entries(&self, digest_id: i64, entries: &[DigestEntry]) -> Result<()> {
        let mut s = self.write()?;
        if !s.digests.contains_key(&digest_id) {
            bail!("digest {} not found", digest_id);
        }
        s.entries.insert(digest_id, entries.to_vec());
        Ok(())
    }

    async fn save_digest_error(
        &self,
        window: &Window,
        chat_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut s = self.write()?;
        if let Some(id) = s.window_digest_id(window) {
            if let Some(d) = s.digests.get_mut(&id) {
                if d.status == DigestStatus::Error {
                    d.chat_id = chat_id.to_string();
                    d.error = Some(error.to_string());
                    d.created_at = now;
                }
            }
            return Ok(());
        }
        let id = s.next_id();
        s.digests.insert(
            id,
            Digest {
                id,
                window: *window,
                chat_id: chat_id.to_string(),
                message_id: None,
                status: DigestStatus::Error,
                posted_at: None,
                error: Some(error.to_string()),
                created_at: now,
            },
        );
        Ok(())
    }

    async fn clear_digest_errors(&self) -> Result<u64> {
        let mut s = self.write()?;
        let failed: Vec<i64> = s
            .digests
            .values()
            .filter(|d| d.status == DigestStatus::Error)
            .map(|d| d.id)
            .collect();
        for id in &failed {
            s.digests.remove(id);
            s.entries.remove(id);
        }
        Ok(failed.len() as u64)
    }

    async fn mark_items_digested(&self, item_ids: &[i64], now: DateTime<Utc>) -> Result<u64> {
        Ok(self.write()?.mark_items_digested(item_ids, now))
    }

    async fn record_published_digest(
        &self,
        window: &Window,
        chat_id: &str,
        message_id: &str,
        entries: &[DigestEntry],
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut s = self.write()?;
        let id = s.save_digest(window, chat_id, message_id, now);
        s.entries.insert(id, entries.to_vec());
        let item_ids: Vec<i64> = entries.iter().flat_map(|e| e.item_ids.iter().copied()).collect();
        s.mark_items_digested(&item_ids, now);
        Ok(id)
    }

    async fn get_digest(&self, window: &Window) -> Result<Option<Digest>> {
        let s = self.read()?;
        Ok(s.digests.values().find(|d| d.window == *window).cloned())
    }

    async fn get_digest_entries(&self, digest_id: i64) -> Result<Vec<DigestEntry>> {
        Ok(self
            .read()?
            .entries
            .get(&digest_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_summary(
        &self,
        canonical_hash: &str,
        digest_language: &str,
    ) -> Result<Option<SummaryCacheEntry>> {
        let s = self.read()?;
        Ok(s.summaries
            .get(&(canonical_hash.to_string(), digest_language.to_string()))
            .cloned())
    }

    async fn upsert_summary(&self, entry: &SummaryCacheEntry, _now: DateTime<Utc>) -> Result<()> {
        let mut s = self.write()?;
        s.summaries.insert(
            (entry.canonical_hash.clone(), entry.digest_language.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn record_dropped(
        &self,
        raw_message_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut s = self.write()?;
        s.dropped.push((raw_message_id, reason.to_string(), now));
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        lock_id: i64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut s = self.write()?;
        match s.locks.get(&lock_id) {
            Some(acquired_at) if *acquired_at > now - ttl => Ok(false),
            _ => {
                s.locks.insert(lock_id, now);
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, lock_id: i64, acquired_at: DateTime<Utc>) -> Result<()> {
        let mut s = self.write()?;
        if s.locks.get(&lock_id) == Some(&acquired_at) {
            s.locks.remove(&lock_id);
        }
        Ok(())
    }

    async fn pipeline_counts(&self) -> Result<PipelineCounts> {
        let s = self.read()?;
        let count_status = |status: ItemStatus| {
            s.items.values().filter(|i| i.status == status).count() as i64
        };
        Ok(PipelineCounts {
            raw_messages: s.raw.len() as i64,
            unprocessed: s.raw.values().filter(|m| m.processed_at.is_none()).count() as i64,
            claimed: s.raw.values().filter(|m| m.is_claimed()).count() as i64,
            ready: count_status(ItemStatus::Ready),
            error: count_status(ItemStatus::Error),
            retry: count_status(ItemStatus::Retry),
            digested: count_status(ItemStatus::Digested),
            duplicates: s
                .items
                .values()
                .filter(|i| i.duplicate_of_item_id.is_some())
                .count() as i64,
            embeddings: s.vectors.len() as i64,
            digests_posted: s
                .digests
                .values()
                .filter(|d| d.status == DigestStatus::Posted)
                .count() as i64,
            digests_failed: s
                .digests
                .values()
                .filter(|d| d.status == DigestStatus::Error)
                .count() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn ingest(store: &InMemoryStore, channel: &str, msg_id: i64, at: i64) -> i64 {
        store
            .upsert_raw_message(&NewRawMessage::new(channel, msg_id, ts(at), format!("text {msg_id}")))
            .await
            .unwrap()
    }

    fn ready_item(raw_message_id: i64, at: i64) -> NewItem {
        NewItem {
            raw_message_id,
            relevance_score: 0.8,
            importance_score: 0.7,
            topic: "markets".into(),
            summary: "summary".into(),
            language: "en".into(),
            first_seen_at: ts(at),
        }
    }

    #[tokio::test]
    async fn test_upsert_raw_message_is_keyed() {
        let store = InMemoryStore::new();
        let a = ingest(&store, "@a", 1, 10).await;
        let again = ingest(&store, "@a", 1, 10).await;
        let other = ingest(&store, "@b", 1, 10).await;
        assert_eq!(a, again);
        assert_ne!(a, other);
    }

    #[tokio::test]
    async fn test_claims_are_ordered_and_exclusive() {
        let store = InMemoryStore::new();
        let late = ingest(&store, "@a", 1, 300).await;
        let early = ingest(&store, "@a", 2, 100).await;

        let first = store.claim_pending_batch(1, 5, ts(1_000)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].raw_message_id(), early);

        let second = store.claim_pending_batch(10, 5, ts(1_000)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].raw_message_id(), late);

        assert!(store.claim_pending_batch(10, 5, ts(1_000)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_items_wait_for_backoff() {
        let store = InMemoryStore::new();
        let raw = ingest(&store, "@a", 1, 0).await;
        store.claim_pending_batch(1, 5, ts(100)).await.unwrap();
        let rec = store
            .save_item_error(raw, "boom", &RetryPolicy::default(), ts(100))
            .await
            .unwrap();
        store.release_claim(raw).await.unwrap();
        assert_eq!(rec.retry_count, 1);
        assert_eq!(rec.next_retry_at, ts(160));

        assert!(store.claim_pending_batch(1, 5, ts(159)).await.unwrap().is_empty());
        let claims = store.claim_pending_batch(1, 5, ts(160)).await.unwrap();
        assert_eq!(claims.len(), 1);
        assert!(claims[0].is_retry());
        let item = store.get_item_by_raw_message(raw).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Retry);
    }

    #[tokio::test]
    async fn test_save_item_preserves_retry_count() {
        let store = InMemoryStore::new();
        let raw = ingest(&store, "@a", 1, 0).await;
        store
            .save_item_error(raw, "boom", &RetryPolicy::default(), ts(1))
            .await
            .unwrap();
        let id = store.save_item(&ready_item(raw, 0)).await.unwrap();
        let again = store.save_item(&ready_item(raw, 0)).await.unwrap();
        assert_eq!(id, again);
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Ready);
        assert_eq!(item.retry_count, 1);
        assert!(item.error.is_none());
    }

    #[tokio::test]
    async fn test_mark_duplicate_never_chains() {
        let store = InMemoryStore::new();
        let mut ids = Vec::new();
        for n in 0..3 {
            let raw = ingest(&store, "@a", n, n).await;
            ids.push(store.save_item(&ready_item(raw, n)).await.unwrap());
        }
        // b -> c, then c -> a: b must end up pointing at a.
        store.mark_duplicate(ids[1], ids[2]).await.unwrap();
        store.mark_duplicate(ids[2], ids[0]).await.unwrap();
        let b = store.get_item(ids[1]).await.unwrap().unwrap();
        assert_eq!(b.duplicate_of_item_id, Some(ids[0]));
        assert!(store.mark_duplicate(ids[0], ids[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_lock_ttl_takeover() {
        let store = InMemoryStore::new();
        let ttl = Duration::seconds(60);
        assert!(store.try_acquire_lock(7, ttl, ts(0)).await.unwrap());
        assert!(!store.try_acquire_lock(7, ttl, ts(30)).await.unwrap());
        assert!(store.try_acquire_lock(7, ttl, ts(61)).await.unwrap());
        // The first holder finishing late must not free the new holder's lock.
        store.release_lock(7, ts(0)).await.unwrap();
        assert!(!store.try_acquire_lock(7, ttl, ts(62)).await.unwrap());
        store.release_lock(7, ts(61)).await.unwrap();
        assert!(store.try_acquire_lock(7, ttl, ts(62)).await.unwrap());
    }

    #[tokio::test]
    async fn test_digest_error_replaced_by_posted() {
        let store = InMemoryStore::new();
        let w = Window::new(ts(0), ts(3_600)).unwrap();
        let grace = Duration::hours(1);
        store.save_digest_error(&w, "chat", "timeout", ts(4_000)).await.unwrap();
        assert!(store.digest_exists(&w, grace, ts(4_100)).await.unwrap());
        assert!(!store.digest_exists(&w, grace, ts(7_601)).await.unwrap());

        let id = store.save_digest(&w, "chat", "m1", ts(7_700)).await.unwrap();
        let again = store.save_digest(&w, "chat", "m2", ts(7_800)).await.unwrap();
        assert_eq!(id, again);
        let d = store.get_digest(&w).await.unwrap().unwrap();
        assert_eq!(d.status, DigestStatus::Posted);
        assert_eq!(d.message_id.as_deref(), Some("m1"));

        store.save_digest_error(&w, "chat", "late", ts(7_900)).await.unwrap();
        assert_eq!(store.get_digest(&w).await.unwrap().unwrap().status, DigestStatus::Posted);
    }
}
