//! Enrichment worker pool.
//!
//! N cooperating tasks each loop over:
//!
//! 1. `claim_pending_batch(batch_size)`; sleep `idle_backoff` when empty.
//! 2. Process the claims with bounded fan-out.
//!
//! Per message: filter gate → summary cache → enrichment → `save_item` →
//! embedding (relevance ≥ `min_relevance`) → deduplication →
//! `mark_processed`. Provider failures go through `save_item_error`:
//! retryable ones release the claim until `next_retry_at`, permanent or
//! exhausted ones are marked processed and stay in `error`.
//!
//! Every claim is held by a [`ClaimGuard`] that returns it to the queue
//! unless processing completed, so errors, panics and cancellation never
//! leave a message claimed. A message whose item was saved but which never
//! reached `mark_processed` is claimed again and resumed after the
//! enrichment step. A separate recovery task clears claims
//! abandoned by crashed processes.

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use channel_digest_core::dedup::{DedupCandidate, DedupOutcome, DedupPolicy, Deduplicator};
use channel_digest_core::embedding::EmbeddingProvider;
use channel_digest_core::error::{PipelineError, PipelineResult, ProviderError};
use channel_digest_core::models::{Claim, Enrichment, Item, ItemStatus, NewItem, RawMessage};
use channel_digest_core::provider::{Enricher, EnrichmentRequest, MessageFilter};
use channel_digest_core::retry::RetryPolicy;
use channel_digest_core::store::Store;
use channel_digest_core::summary_cache::SummaryCache;

use crate::config::{Config, FilterMode};

/// Tunables for the pool, resolved from `[worker]`, `[retry]` and `[dedup]`.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub fan_out: usize,
    pub idle_backoff: Duration,
    pub stale_claim_after: chrono::Duration,
    pub recovery_interval: Duration,
    pub min_relevance: f64,
    pub digest_language: String,
    pub filter_mode: FilterMode,
    pub provider_timeout: Duration,
    pub retry: RetryPolicy,
    pub dedup: DedupPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.worker.workers,
            batch_size: config.worker.batch_size,
            fan_out: config.worker.fan_out,
            idle_backoff: Duration::from_millis(config.worker.idle_backoff_ms),
            stale_claim_after: config.stale_claim_after(),
            recovery_interval: Duration::from_secs(config.worker.recovery_interval_secs.max(1)),
            min_relevance: config.worker.min_relevance,
            digest_language: config.worker.digest_language.clone(),
            filter_mode: config.worker.filter_mode,
            provider_timeout: Duration::from_secs(config.worker.provider_timeout_secs.max(1)),
            retry: config.retry_policy(),
            dedup: config.dedup_policy(),
        }
    }
}

/// Returns a claim to the queue when dropped, unless disarmed.
pub struct ClaimGuard {
    store: Arc<dyn Store>,
    raw_message_id: i64,
    armed: bool,
}

impl ClaimGuard {
    pub fn new(store: Arc<dyn Store>, raw_message_id: i64) -> Self {
        Self {
            store,
            raw_message_id,
            armed: true,
        }
    }

    /// Processing reached a terminal state; keep the claim markers as written.
    pub fn disarm(mut self) {
        self.armed = false;
    }

    /// Release the claim now, waiting for the store.
    pub async fn release(mut self) -> Result<()> {
        self.armed = false;
        self.store.release_claim(self.raw_message_id).await
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let raw_message_id = self.raw_message_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(e) = store.release_claim(raw_message_id).await {
                        tracing::warn!(raw_message_id, error = %e, "failed to release claim; left for recovery");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(raw_message_id, "no runtime to release claim; left for recovery");
            }
        }
    }
}

/// What happened to one claimed message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Enriched {
        item_id: i64,
        cached: bool,
        embedded: bool,
        dedup: DedupOutcome,
    },
    /// An earlier attempt saved the item; only embedding, dedup and
    /// `mark_processed` ran. `embedded` is set only for a vector computed
    /// now. `dedup` is `None` when the item was already linked or digested.
    Resumed {
        item_id: i64,
        embedded: bool,
        dedup: Option<DedupOutcome>,
    },
    /// Filtered with `filter_mode = "score_zero"`.
    Filtered { item_id: i64, reason: String },
    /// Filtered with `filter_mode = "drop_log"`.
    Dropped { reason: String },
    /// Retryable failure; the claim was released.
    Retrying {
        retry_count: u32,
        next_retry_at: chrono::DateTime<Utc>,
    },
    /// Terminal failure; the message was marked processed.
    Failed { error: String },
}

/// Lifetime counters for one pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    claimed: AtomicU64,
    enriched: AtomicU64,
    resumed: AtomicU64,
    cache_hits: AtomicU64,
    embedded: AtomicU64,
    duplicates: AtomicU64,
    filtered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    recovered: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub claimed: u64,
    pub enriched: u64,
    pub resumed: u64,
    pub cache_hits: u64,
    pub embedded: u64,
    pub duplicates: u64,
    pub filtered: u64,
    pub retried: u64,
    pub failed: u64,
    pub recovered: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            enriched: self.enriched.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            embedded: self.embedded.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Enriched {
                cached,
                embedded,
                dedup,
                ..
            } => {
                self.enriched.fetch_add(1, Ordering::Relaxed);
                if *cached {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                }
                if *embedded {
                    self.embedded.fetch_add(1, Ordering::Relaxed);
                }
                if !matches!(dedup, DedupOutcome::Unique) {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                }
            }
            ProcessOutcome::Resumed {
                embedded, dedup, ..
            } => {
                self.resumed.fetch_add(1, Ordering::Relaxed);
                if *embedded {
                    self.embedded.fetch_add(1, Ordering::Relaxed);
                }
                if dedup.as_ref().is_some_and(|d| !matches!(d, DedupOutcome::Unique)) {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                }
            }
            ProcessOutcome::Filtered { .. } | ProcessOutcome::Dropped { .. } => {
                self.filtered.fetch_add(1, Ordering::Relaxed);
            }
            ProcessOutcome::Retrying { .. } => {
                self.retried.fetch_add(1, Ordering::Relaxed);
            }
            ProcessOutcome::Failed { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Summary of one claim-and-process round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Claims abandoned to a storage error or cancellation.
    pub aborted: usize,
}

pub struct EnrichmentWorker {
    store: Arc<dyn Store>,
    enricher: Arc<dyn Enricher>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    filter: Arc<dyn MessageFilter>,
    cache: SummaryCache,
    dedup: Deduplicator,
    settings: WorkerSettings,
    stats: WorkerStats,
}

impl EnrichmentWorker {
    /// `embedder = None` skips the embedding step; dedup then falls back to
    /// the strict hash check.
    pub fn new(
        store: Arc<dyn Store>,
        enricher: Arc<dyn Enricher>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        filter: Arc<dyn MessageFilter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            cache: SummaryCache::new(Arc::clone(&store)),
            dedup: Deduplicator::new(Arc::clone(&store), settings.dedup),
            store,
            enricher,
            embedder,
            filter,
            settings,
            stats: WorkerStats::default(),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Claim one batch and process it. Returns once every claim is settled.
    pub async fn tick(&self, cancel: &CancellationToken) -> PipelineResult<TickReport> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let claims = self
            .store
            .claim_pending_batch(
                self.settings.batch_size,
                self.settings.retry.max_retries,
                Utc::now(),
            )
            .await?;

        let report = Mutex::new(TickReport {
            claimed: claims.len(),
            ..TickReport::default()
        });
        if claims.is_empty() {
            return Ok(TickReport::default());
        }
        self.stats
            .claimed
            .fetch_add(claims.len() as u64, Ordering::Relaxed);
        tracing::debug!(claimed = claims.len(), "claimed batch");

        stream::iter(claims)
            .for_each_concurrent(self.settings.fan_out, |claim| {
                let report = &report;
                async move {
                    let raw_message_id = claim.raw_message_id();
                    let result = self.process_claim(claim, cancel).await;
                    let Ok(mut r) = report.lock() else {
                        return;
                    };
                    match result {
                        Ok(ProcessOutcome::Retrying { .. }) => r.retrying += 1,
                        Ok(ProcessOutcome::Failed { .. }) => r.failed += 1,
                        Ok(_) => r.completed += 1,
                        Err(PipelineError::Cancelled) => r.aborted += 1,
                        Err(PipelineError::Storage(e)) => {
                            r.aborted += 1;
                            tracing::error!(raw_message_id, error = %e, "storage error while processing message");
                        }
                    }
                }
            })
            .await;

        let report = report
            .into_inner()
            .map_err(|_| PipelineError::Storage(anyhow::anyhow!("tick report lock poisoned")))?;
        if cancel.is_cancelled() && report.aborted > 0 {
            return Err(PipelineError::Cancelled);
        }
        Ok(report)
    }

    /// Process one claimed message through to a terminal or retry state.
    pub async fn process_claim(
        &self,
        claim: Claim,
        cancel: &CancellationToken,
    ) -> PipelineResult<ProcessOutcome> {
        let guard = ClaimGuard::new(Arc::clone(&self.store), claim.raw_message_id());
        let resume_item_id = if claim.is_resume() { claim.item_id } else { None };
        let message = claim.message;
        let raw_message_id = message.id;

        // Filter gate
        if let Some(reason) = self.filter.should_filter(&message) {
            let outcome = match self.settings.filter_mode {
                FilterMode::ScoreZero => {
                    let item_id = self.store.save_item(&NewItem::filtered(&message)).await?;
                    ProcessOutcome::Filtered { item_id, reason }
                }
                FilterMode::DropLog => {
                    self.store
                        .record_dropped(raw_message_id, &reason, Utc::now())
                        .await?;
                    ProcessOutcome::Dropped { reason }
                }
            };
            self.store.mark_processed(raw_message_id, Utc::now()).await?;
            guard.disarm();
            tracing::debug!(raw_message_id, channel = %message.channel, "message filtered");
            self.stats.record(&outcome);
            return Ok(outcome);
        }

        if let Some(item_id) = resume_item_id {
            if let Some(item) = self.store.get_item(item_id).await? {
                return self.resume(guard, cancel, &message, item).await;
            }
        }

        // Summary cache, then the provider
        let language = self.settings.digest_language.as_str();
        let cached = self
            .cache
            .lookup(&message.canonical_hash, language)
            .await
            .map_err(|e| PipelineError::Storage(e.into()))?;

        let (enrichment, from_cache) = match cached {
            Some(e) => (e, true),
            None => {
                let request = EnrichmentRequest::for_message(&message, Some(language));
                let result = self
                    .call_provider(cancel, "enrichment", self.enricher.enrich(&request))
                    .await;
                match result {
                    Ok(e) => {
                        let e = e.clamped();
                        self.cache
                            .remember(&message.canonical_hash, language, &e, Utc::now())
                            .await
                            .map_err(|e| PipelineError::Storage(e.into()))?;
                        (e, false)
                    }
                    Err(ProviderError::Cancelled) => {
                        guard.release().await?;
                        return Err(PipelineError::Cancelled);
                    }
                    Err(err) => return self.record_failure(guard, raw_message_id, err).await,
                }
            }
        };

        let item_id = self
            .store
            .save_item(&NewItem::from_enrichment(&message, &enrichment))
            .await?;

        let vector = self.embed_item(cancel, item_id, &enrichment, &message.text).await?;
        let dedup = self.deduplicate(item_id, &message, vector.as_deref()).await?;

        self.store.mark_processed(raw_message_id, Utc::now()).await?;
        guard.disarm();

        tracing::debug!(
            raw_message_id,
            item_id,
            cached = from_cache,
            relevance = enrichment.relevance,
            importance = enrichment.importance,
            "message enriched"
        );
        let outcome = ProcessOutcome::Enriched {
            item_id,
            cached: from_cache,
            embedded: vector.is_some(),
            dedup,
        };
        self.stats.record(&outcome);
        Ok(outcome)
    }

    /// Finish a message whose item an earlier attempt saved. Enrichment is not
    /// repeated; a stored vector is reused and dedup runs again.
    async fn resume(
        &self,
        guard: ClaimGuard,
        cancel: &CancellationToken,
        message: &RawMessage,
        item: Item,
    ) -> PipelineResult<ProcessOutcome> {
        let raw_message_id = message.id;
        let (embedded, dedup) = if item.status == ItemStatus::Digested || item.is_duplicate() {
            (false, None)
        } else {
            let (vector, embedded) = match self.store.get_embedding(item.id).await? {
                Some(v) => (Some(v), false),
                None => {
                    let v = self
                        .embed_item(cancel, item.id, &item.enrichment(), &message.text)
                        .await?;
                    let embedded = v.is_some();
                    (v, embedded)
                }
            };
            let dedup = self.deduplicate(item.id, message, vector.as_deref()).await?;
            (embedded, Some(dedup))
        };

        self.store.mark_processed(raw_message_id, Utc::now()).await?;
        guard.disarm();

        tracing::info!(raw_message_id, item_id = item.id, "resumed unfinished message");
        let outcome = ProcessOutcome::Resumed {
            item_id: item.id,
            embedded,
            dedup,
        };
        self.stats.record(&outcome);
        Ok(outcome)
    }

    async fn deduplicate(
        &self,
        item_id: i64,
        message: &RawMessage,
        vector: Option<&[f32]>,
    ) -> PipelineResult<DedupOutcome> {
        let candidate = DedupCandidate {
            item_id,
            raw_message_id: message.id,
            channel: message.channel.clone(),
            canonical_hash: message.canonical_hash.clone(),
            first_seen_at: message.source_date,
        };
        let dedup = match vector {
            Some(v) => self.dedup.check(&candidate, v, Utc::now()).await?,
            None => self.dedup.check_strict(&candidate).await?,
        };
        match &dedup {
            DedupOutcome::Unique => {}
            DedupOutcome::Duplicate {
                canonical_item_id,
                kind,
            } => {
                tracing::info!(item_id, canonical_item_id, kind = %kind, "duplicate linked");
            }
            DedupOutcome::Supersedes {
                duplicate_item_id,
                kind,
            } => {
                tracing::info!(item_id, duplicate_item_id, kind = %kind, "earlier item supersedes match");
            }
        }
        Ok(dedup)
    }

    /// Embed and store the item's vector. Failures only cost the vector; the
    /// backfill command picks the item up later.
    async fn embed_item(
        &self,
        cancel: &CancellationToken,
        item_id: i64,
        enrichment: &Enrichment,
        text: &str,
    ) -> PipelineResult<Option<Vec<f32>>> {
        let Some(embedder) = &self.embedder else {
            return Ok(None);
        };
        if enrichment.relevance < self.settings.min_relevance {
            return Ok(None);
        }

        match self
            .call_provider(cancel, "embedding", embedder.embed(text))
            .await
        {
            Ok(vector) if vector.is_empty() => Ok(None),
            Ok(vector) => {
                self.store
                    .save_embedding(item_id, &vector, Utc::now())
                    .await?;
                Ok(Some(vector))
            }
            Err(e) => {
                tracing::warn!(item_id, error = %e, "embedding failed; item left for backfill");
                Ok(None)
            }
        }
    }

    async fn record_failure(
        &self,
        guard: ClaimGuard,
        raw_message_id: i64,
        err: ProviderError,
    ) -> PipelineResult<ProcessOutcome> {
        let now = Utc::now();
        let message = err.to_string();
        let record = self
            .store
            .save_item_error(raw_message_id, &message, &self.settings.retry, now)
            .await?;

        let outcome = if err.is_retryable() && !record.exhausted {
            guard.release().await?;
            tracing::warn!(
                raw_message_id,
                kind = err.kind(),
                retry_count = record.retry_count,
                next_retry_at = %record.next_retry_at,
                "enrichment failed, will retry"
            );
            ProcessOutcome::Retrying {
                retry_count: record.retry_count,
                next_retry_at: record.next_retry_at,
            }
        } else {
            self.store.mark_processed(raw_message_id, now).await?;
            guard.disarm();
            tracing::error!(
                raw_message_id,
                kind = err.kind(),
                retry_count = record.retry_count,
                error = %message,
                "enrichment failed terminally"
            );
            ProcessOutcome::Failed { error: message }
        };
        self.stats.record(&outcome);
        Ok(outcome)
    }

    /// Race a provider call against cancellation and the per-call timeout.
    async fn call_provider<T, F>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        call: F,
    ) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = tokio::time::timeout(self.settings.provider_timeout, call) => match result {
                Ok(r) => r,
                Err(_) => Err(ProviderError::Transient(format!(
                    "{} call timed out after {}s",
                    what,
                    self.settings.provider_timeout.as_secs()
                ))),
            },
        }
    }

    /// Clear claims older than `stale_claim_after`.
    pub async fn recover(&self) -> Result<u64> {
        let recovered = self
            .store
            .recover_stuck_claims(self.settings.stale_claim_after, Utc::now())
            .await?;
        if recovered > 0 {
            self.stats.recovered.fetch_add(recovered, Ordering::Relaxed);
            tracing::warn!(recovered, "recovered stuck claims");
        }
        Ok(recovered)
    }

    /// Run the pool until `cancel` fires: `settings.workers` claim loops
    /// plus the recovery loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            workers = self.settings.workers,
            batch_size = self.settings.batch_size,
            fan_out = self.settings.fan_out,
            "worker pool starting"
        );

        let mut handles = Vec::with_capacity(self.settings.workers + 1);
        for worker_id in 0..self.settings.workers {
            let worker = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker.claim_loop(worker_id, cancel).await;
            }));
        }
        {
            let worker = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker.recovery_loop(cancel).await;
            }));
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker task panicked");
            }
        }

        tracing::info!(stats = ?self.stats(), "worker pool stopped");
        Ok(())
    }

    async fn claim_loop(&self, worker_id: usize, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let idle = match self.tick(&cancel).await {
                Ok(report) => report.claimed == 0,
                Err(PipelineError::Cancelled) => break,
                Err(PipelineError::Storage(e)) => {
                    tracing::error!(worker_id, error = %e, "worker tick failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.idle_backoff) => {}
                }
            }
        }
        tracing::debug!(worker_id, "worker stopped");
    }

    async fn recovery_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.recovery_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.recover().await {
                        tracing::error!(error = %e, "claim recovery failed");
                    }
                }
            }
        }
    }
}
