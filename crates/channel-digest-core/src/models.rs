//! Core data models shared by the store, the engines and the adapters.
//!
//! Timestamps are `DateTime<Utc>` in memory; the SQLite store persists them
//! as unix seconds.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::canonical::canonical_hash;

/// A message as delivered by the ingestion source, before it has an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRawMessage {
    pub channel: String,
    pub source_message_id: i64,
    pub source_date: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub entities_json: Option<String>,
    #[serde(default)]
    pub media_json: Option<String>,
    #[serde(default)]
    pub forwarded_from: Option<String>,
    #[serde(default)]
    pub canonical_hash: String,
}

impl NewRawMessage {
    /// Build a message and compute its canonical hash from `text`.
    pub fn new(
        channel: impl Into<String>,
        source_message_id: i64,
        source_date: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            channel: channel.into(),
            source_message_id,
            source_date,
            canonical_hash: canonical_hash(&text),
            text,
            entities_json: None,
            media_json: None,
            forwarded_from: None,
        }
    }

    /// Fill in the canonical hash if the ingestor did not supply one.
    pub fn with_computed_hash(mut self) -> Self {
        if self.canonical_hash.is_empty() {
            self.canonical_hash = canonical_hash(&self.text);
        }
        self
    }
}

/// An ingested message row.
///
/// A row with `processing_started_at` set and `processed_at` unset is
/// *claimed* by a worker.
#[derive(Debug, Clone, Serialize)]
pub struct RawMessage {
    pub id: i64,
    pub channel: String,
    pub source_message_id: i64,
    pub source_date: DateTime<Utc>,
    pub text: String,
    pub entities_json: Option<String>,
    pub media_json: Option<String>,
    pub forwarded_from: Option<String>,
    pub canonical_hash: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub discoveries_extracted: bool,
}

impl RawMessage {
    pub fn is_claimed(&self) -> bool {
        self.processing_started_at.is_some() && self.processed_at.is_none()
    }

    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            channel: self.channel.clone(),
            msg_id: self.source_message_id,
        }
    }
}

/// A raw message handed to a worker by `claim_pending_batch`.
#[derive(Debug, Clone)]
pub struct Claim {
    pub message: RawMessage,
    /// Existing item for this message, if an earlier attempt wrote one.
    pub item_id: Option<i64>,
    pub item_status: Option<ItemStatus>,
    /// Failures recorded so far (0 for a first attempt).
    pub retry_count: u32,
}

impl Claim {
    pub fn raw_message_id(&self) -> i64 {
        self.message.id
    }

    /// An earlier attempt failed at the provider.
    pub fn is_retry(&self) -> bool {
        matches!(self.item_status, Some(ItemStatus::Error | ItemStatus::Retry))
    }

    /// An earlier attempt saved the enrichment but stopped before the
    /// message was marked processed.
    pub fn is_resume(&self) -> bool {
        matches!(self.item_status, Some(ItemStatus::Ready | ItemStatus::Digested))
    }
}

/// Lifecycle state of an [`Item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Ready,
    Error,
    Retry,
    Digested,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Ready => "ready",
            ItemStatus::Error => "error",
            ItemStatus::Retry => "retry",
            ItemStatus::Digested => "digested",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(ItemStatus::Ready),
            "error" => Ok(ItemStatus::Error),
            "retry" => Ok(ItemStatus::Retry),
            "digested" => Ok(ItemStatus::Digested),
            other => bail!("unknown item status: '{}'", other),
        }
    }
}

/// Output of the enrichment provider (or a summary cache hit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub topic: String,
    pub summary: String,
    pub language: String,
    pub relevance: f64,
    pub importance: f64,
}

impl Enrichment {
    /// Clamp both scores into `[0, 1]`; NaN becomes 0.
    pub fn clamped(mut self) -> Self {
        self.relevance = clamp_score(self.relevance);
        self.importance = clamp_score(self.importance);
        self
    }
}

fn clamp_score(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// A successful enrichment ready to be written with `save_item`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub raw_message_id: i64,
    pub relevance_score: f64,
    pub importance_score: f64,
    pub topic: String,
    pub summary: String,
    pub language: String,
    pub first_seen_at: DateTime<Utc>,
}

impl NewItem {
    pub fn from_enrichment(message: &RawMessage, enrichment: &Enrichment) -> Self {
        Self {
            raw_message_id: message.id,
            relevance_score: enrichment.relevance,
            importance_score: enrichment.importance,
            topic: enrichment.topic.clone(),
            summary: enrichment.summary.clone(),
            language: enrichment.language.clone(),
            first_seen_at: message.source_date,
        }
    }

    /// Item written for a message rejected by the content filter.
    pub fn filtered(message: &RawMessage) -> Self {
        Self {
            raw_message_id: message.id,
            relevance_score: 0.0,
            importance_score: 0.0,
            topic: String::new(),
            summary: String::new(),
            language: String::new(),
            first_seen_at: message.source_date,
        }
    }
}

/// Enrichment result for exactly one raw message.
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: i64,
    pub raw_message_id: i64,
    pub channel: String,
    pub source_message_id: i64,
    pub canonical_hash: String,
    pub relevance_score: f64,
    pub importance_score: f64,
    pub topic: String,
    pub summary: String,
    pub language: String,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub digested_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub duplicate_of_item_id: Option<i64>,
}

impl Item {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            channel: self.channel.clone(),
            msg_id: self.source_message_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of_item_id.is_some()
    }

    /// The enrichment this item was saved with.
    pub fn enrichment(&self) -> Enrichment {
        Enrichment {
            topic: self.topic.clone(),
            summary: self.summary.clone(),
            language: self.language.clone(),
            relevance: self.relevance_score,
            importance: self.importance_score,
        }
    }
}

/// Result of recording an enrichment failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemErrorRecord {
    pub item_id: i64,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    /// `true` once `retry_count` has reached the retry ceiling.
    pub exhausted: bool,
}

/// A canonical item found by hash or by similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRef {
    pub item_id: i64,
    pub first_seen_at: DateTime<Utc>,
    pub status: ItemStatus,
}

/// A `{channel, msg_id}` reference to an upstream message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub channel: String,
    pub msg_id: i64,
}

/// A half-open time interval `[start, end)` in source time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            bail!("window end ({}) must be after start ({})", end, start);
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    /// Stable 63-bit key used for the per-window advisory lock.
    pub fn lock_key(&self) -> i64 {
        let mut hasher = Sha256::new();
        hasher.update(b"digest-window");
        hasher.update(self.start.timestamp().to_le_bytes());
        hasher.update(self.end.timestamp().to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(bytes) >> 1) as i64
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// A digest-eligible item loaded for a window.
#[derive(Debug, Clone)]
pub struct WindowItem {
    pub item_id: i64,
    pub channel: String,
    pub source_message_id: i64,
    pub topic: String,
    pub summary: String,
    pub importance_score: f64,
    pub first_seen_at: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
}

impl WindowItem {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            channel: self.channel.clone(),
            msg_id: self.source_message_id,
        }
    }
}

/// A duplicate item pointing at a canonical one.
#[derive(Debug, Clone)]
pub struct DuplicateRef {
    pub item_id: i64,
    pub duplicate_of_item_id: i64,
    pub channel: String,
    pub source_message_id: i64,
}

/// Cluster membership to be written for a window.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDraft {
    pub topic: Option<String>,
    pub item_ids: Vec<i64>,
}

/// A persisted cluster with its members in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMembership {
    pub cluster_id: i64,
    pub topic: Option<String>,
    pub item_ids: Vec<i64>,
}

/// One body paragraph of a digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub title: String,
    pub body: String,
    pub sources: Vec<SourceRef>,
    /// Items covered by this entry, duplicates included.
    #[serde(default)]
    pub item_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestStatus {
    Posted,
    Error,
}

impl DigestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestStatus::Posted => "posted",
            DigestStatus::Error => "error",
        }
    }
}

impl FromStr for DigestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "posted" => Ok(DigestStatus::Posted),
            "error" => Ok(DigestStatus::Error),
            other => bail!("unknown digest status: '{}'", other),
        }
    }
}

/// The authoritative record of a digest publication (or failed attempt).
#[derive(Debug, Clone, Serialize)]
pub struct Digest {
    pub id: i64,
    pub window: Window,
    pub chat_id: String,
    pub message_id: Option<String>,
    pub status: DigestStatus,
    pub posted_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Reusable enrichment outputs keyed by `(canonical_hash, digest_language)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryCacheEntry {
    pub canonical_hash: String,
    pub digest_language: String,
    pub summary: String,
    pub topic: String,
    pub language: String,
    pub relevance: f64,
    pub importance: f64,
}

impl SummaryCacheEntry {
    pub fn from_enrichment(hash: &str, digest_language: &str, e: &Enrichment) -> Self {
        Self {
            canonical_hash: hash.to_string(),
            digest_language: digest_language.to_string(),
            summary: e.summary.clone(),
            topic: e.topic.clone(),
            language: e.language.clone(),
            relevance: e.relevance,
            importance: e.importance,
        }
    }

    pub fn to_enrichment(&self) -> Enrichment {
        Enrichment {
            topic: self.topic.clone(),
            summary: self.summary.clone(),
            language: self.language.clone(),
            relevance: self.relevance,
            importance: self.importance,
        }
    }
}

/// A ready item that still needs an embedding vector.
#[derive(Debug, Clone)]
pub struct PendingEmbedding {
    pub item_id: i64,
    pub text: String,
}

/// Row counts across the pipeline, for operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineCounts {
    pub raw_messages: i64,
    pub unprocessed: i64,
    pub claimed: i64,
    pub ready: i64,
    pub error: i64,
    pub retry: i64,
    pub digested: i64,
    pub duplicates: i64,
    pub embeddings: i64,
    pub digests_posted: i64,
    pub digests_failed: i64,
}
