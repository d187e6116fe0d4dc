//! Duplicate detection for freshly enriched items.
//!
//! Three checks run in order and the first hit wins:
//!
//! 1. **Strict**: another processed message has the same canonical hash.
//! 2. **Global**: an embedding from any channel within `global_window` is
//!    more similar than `global_similarity`.
//! 3. **Intra-channel**: an embedding from the same channel within
//!    `intra_window` is more similar than `intra_similarity`.
//!
//! The item seen first stays canonical, with the lower item id breaking
//! ties within the same second. When the match turns out to be younger
//! than the new item and has not been digested yet, the link is reversed.
//! Links always point at a root canonical, never at another duplicate.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;

use crate::models::ItemStatus;
use crate::similarity::SimilarityIndex;
use crate::store::{SimilarMatch, Store};

/// Thresholds and look-back windows for similarity dedup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupPolicy {
    pub global_similarity: f32,
    pub global_window: Duration,
    pub intra_similarity: f32,
    pub intra_window: Duration,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            global_similarity: 0.92,
            global_window: Duration::hours(48),
            intra_similarity: 0.88,
            intra_window: Duration::hours(2),
        }
    }
}

impl DedupPolicy {
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("global_similarity", self.global_similarity),
            ("intra_similarity", self.intra_similarity),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("dedup.{} must be in [0, 1], got {}", name, v);
            }
        }
        if self.global_similarity < self.intra_similarity {
            bail!(
                "dedup.global_similarity ({}) must be >= dedup.intra_similarity ({})",
                self.global_similarity,
                self.intra_similarity
            );
        }
        if self.global_window < self.intra_window {
            bail!("dedup global window must be at least as long as the intra-channel window");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    Strict,
    Global,
    Intra,
}

impl DuplicateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateKind::Strict => "strict",
            DuplicateKind::Global => "global",
            DuplicateKind::Intra => "intra",
        }
    }
}

impl fmt::Display for DuplicateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The item being checked.
#[derive(Debug, Clone)]
pub struct DedupCandidate {
    pub item_id: i64,
    pub raw_message_id: i64,
    pub channel: String,
    pub canonical_hash: String,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    /// No duplicate found; the candidate stays canonical.
    Unique,
    /// The candidate now points at `canonical_item_id`.
    Duplicate {
        canonical_item_id: i64,
        kind: DuplicateKind,
    },
    /// An older-looking match was seen later than the candidate and now
    /// points at it.
    Supersedes {
        duplicate_item_id: i64,
        kind: DuplicateKind,
    },
}

impl DedupOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DedupOutcome::Duplicate { .. })
    }
}

/// A match to link against, from either the hash or the vector path.
struct Found {
    item_id: i64,
    first_seen_at: DateTime<Utc>,
    digested: bool,
    duplicate_of_item_id: Option<i64>,
}

impl From<SimilarMatch> for Found {
    fn from(m: SimilarMatch) -> Self {
        Self {
            item_id: m.item_id,
            first_seen_at: m.first_seen_at,
            digested: m.digested,
            duplicate_of_item_id: m.duplicate_of_item_id,
        }
    }
}

pub struct Deduplicator {
    store: Arc<dyn Store>,
    index: SimilarityIndex,
    policy: DedupPolicy,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn Store>, policy: DedupPolicy) -> Self {
        Self {
            index: SimilarityIndex::new(store.clone()),
            store,
            policy,
        }
    }

    pub fn policy(&self) -> &DedupPolicy {
        &self.policy
    }

    /// Run all three checks against `vector`.
    ///
    /// An empty vector short-circuits to [`DedupOutcome::Unique`] without
    /// touching the store.
    pub async fn check(
        &self,
        candidate: &DedupCandidate,
        vector: &[f32],
        now: DateTime<Utc>,
    ) -> Result<DedupOutcome> {
        if vector.is_empty() {
            return Ok(DedupOutcome::Unique);
        }

        if let Some(found) = self.strict_match(candidate).await? {
            return self.link(candidate, found, DuplicateKind::Strict).await;
        }

        let global = self
            .index
            .find_similar(
                vector,
                self.policy.global_similarity,
                now - self.policy.global_window,
                Some(candidate.item_id),
            )
            .await?;
        if let Some(m) = global {
            return self.link(candidate, m.into(), DuplicateKind::Global).await;
        }

        let intra = self
            .index
            .find_similar_in_channel(
                vector,
                &candidate.channel,
                self.policy.intra_similarity,
                now - self.policy.intra_window,
                Some(candidate.item_id),
            )
            .await?;
        if let Some(m) = intra {
            return self.link(candidate, m.into(), DuplicateKind::Intra).await;
        }

        Ok(DedupOutcome::Unique)
    }

    /// Hash-only check, for items that have no embedding.
    pub async fn check_strict(&self, candidate: &DedupCandidate) -> Result<DedupOutcome> {
        match self.strict_match(candidate).await? {
            Some(found) => self.link(candidate, found, DuplicateKind::Strict).await,
            None => Ok(DedupOutcome::Unique),
        }
    }

    async fn strict_match(&self, candidate: &DedupCandidate) -> Result<Option<Found>> {
        if candidate.canonical_hash.is_empty() {
            return Ok(None);
        }
        let Some(r) = self
            .store
            .find_strict_duplicate(&candidate.canonical_hash, candidate.raw_message_id)
            .await?
        else {
            return Ok(None);
        };
        if r.item_id == candidate.item_id {
            return Ok(None);
        }
        let duplicate_of_item_id = self
            .store
            .get_item(r.item_id)
            .await?
            .and_then(|i| i.duplicate_of_item_id);
        Ok(Some(Found {
            item_id: r.item_id,
            first_seen_at: r.first_seen_at,
            digested: r.status == ItemStatus::Digested,
            duplicate_of_item_id,
        }))
    }

    async fn link(
        &self,
        candidate: &DedupCandidate,
        found: Found,
        kind: DuplicateKind,
    ) -> Result<DedupOutcome> {
        // A match that is itself a duplicate stands in for its canonical.
        if let Some(root) = found.duplicate_of_item_id {
            if root == candidate.item_id {
                return Ok(DedupOutcome::Unique);
            }
            let canonical_item_id = self.store.mark_duplicate(candidate.item_id, root).await?;
            return Ok(DedupOutcome::Duplicate {
                canonical_item_id,
                kind,
            });
        }

        if (found.first_seen_at, found.item_id) > (candidate.first_seen_at, candidate.item_id)
            && !found.digested
        {
            self.store
                .mark_duplicate(found.item_id, candidate.item_id)
                .await?;
            return Ok(DedupOutcome::Supersedes {
                duplicate_item_id: found.item_id,
                kind,
            });
        }

        // Another worker may have linked the match to us since it was read.
        let current_root = self
            .store
            .get_item(found.item_id)
            .await?
            .and_then(|i| i.duplicate_of_item_id);
        if current_root == Some(candidate.item_id) {
            return Ok(DedupOutcome::Unique);
        }

        let canonical_item_id = self
            .store
            .mark_duplicate(candidate.item_id, found.item_id)
            .await?;
        Ok(DedupOutcome::Duplicate {
            canonical_item_id,
            kind,
        })
    }
}
