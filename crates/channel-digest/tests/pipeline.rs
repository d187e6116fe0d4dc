//! End-to-end pipeline tests against a real SQLite database.
//!
//! Providers and the publisher are in-test fakes implementing the adapter
//! traits; everything else is the production code path: SQLite store,
//! worker pool, deduplication, clustering and digest assembly.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use channel_digest::assembler::{DigestAssembler, DigestOutcome, DigestSettings};
use channel_digest::clustering::ClusteringEngine;
use channel_digest::config::Config;
use channel_digest::db;
use channel_digest::migrate;
use channel_digest::sqlite_store::SqliteStore;
use channel_digest::worker::{EnrichmentWorker, ProcessOutcome, WorkerSettings};
use channel_digest_core::embedding::EmbeddingProvider;
use channel_digest_core::error::{ProviderError, PublishError};
use channel_digest_core::models::{
    DigestEntry, DigestStatus, Enrichment, ItemStatus, NewItem, NewRawMessage, Window,
};
use channel_digest_core::provider::{
    AcceptAll, Enricher, EnrichmentRequest, Published, Publisher,
};
use channel_digest_core::store::Store;

// ─── Fixtures ───────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    config: Config,
    sqlite: Arc<SqliteStore>,
    store: Arc<dyn Store>,
}

/// `worker_extra` is appended to the `[worker]` section.
async fn harness(worker_extra: &str) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config: Config = toml::from_str(&format!(
        "[db]\npath = \"{}\"\n\n[worker]\nfan_out = 1\nidle_backoff_ms = 10\n{}\n\n[digest]\nchat_id = \"@digest\"\n",
        tmp.path().join("digest.sqlite").display(),
        worker_extra
    ))
    .unwrap();
    channel_digest::config::validate(&config).unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let sqlite = Arc::new(SqliteStore::new(pool));
    let store: Arc<dyn Store> = sqlite.clone();
    Harness {
        _tmp: tmp,
        config,
        sqlite,
        store,
    }
}

/// Whole-second "now", matching the store's timestamp resolution.
fn now_secs() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap()
}

async fn ingest(store: &dyn Store, channel: &str, msg_id: i64, at: DateTime<Utc>, text: &str) -> i64 {
    store
        .upsert_raw_message(&NewRawMessage::new(channel, msg_id, at, text))
        .await
        .unwrap()
}

/// Topic is the first word; summary echoes the text.
struct EchoEnricher {
    calls: AtomicUsize,
}

impl EchoEnricher {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Enricher for EchoEnricher {
    fn name(&self) -> &str {
        "echo"
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<Enrichment, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Enrichment {
            topic: request
                .text
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_lowercase(),
            summary: request.text.clone(),
            language: "en".into(),
            relevance: 0.9,
            importance: 0.8,
        })
    }
}

/// Fails transiently `remaining` times, then behaves like [`EchoEnricher`].
struct FlakyEnricher {
    remaining: AtomicUsize,
    inner: EchoEnricher,
}

#[async_trait]
impl Enricher for FlakyEnricher {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<Enrichment, ProviderError> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Err(ProviderError::Transient("upstream 503".into()));
        }
        self.inner.enrich(request).await
    }
}

/// One axis per keyword, so texts sharing a keyword embed identically.
struct KeywordEmbedder;

const KEYWORDS: [&str; 3] = ["storm", "election", "match"];

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }

    fn dims(&self) -> usize {
        KEYWORDS.len()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                KEYWORDS
                    .iter()
                    .map(|k| if lower.contains(k) { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect())
    }
}

/// Counts publications and keeps the last entries.
struct RecordingPublisher {
    calls: AtomicUsize,
    last: Mutex<Vec<DigestEntry>>,
    fail: bool,
}

impl RecordingPublisher {
    fn new(fail: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            last: Mutex::new(Vec::new()),
            fail,
        }
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    fn name(&self) -> &str {
        "recording"
    }

    async fn publish(
        &self,
        chat_id: &str,
        _language: Option<&str>,
        entries: &[DigestEntry],
    ) -> Result<Published, PublishError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        // Widen the race window for concurrent assemblers.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if self.fail {
            return Err(PublishError::Transient("transport down".into()));
        }
        *self.last.lock().unwrap() = entries.to_vec();
        Ok(Published {
            chat_id: chat_id.to_string(),
            message_id: format!("m{}", n),
        })
    }
}

fn worker(h: &Harness, enricher: Arc<dyn Enricher>, embed: bool) -> EnrichmentWorker {
    let embedder: Option<Arc<dyn EmbeddingProvider>> = if embed {
        Some(Arc::new(KeywordEmbedder))
    } else {
        None
    };
    EnrichmentWorker::new(
        h.store.clone(),
        enricher,
        embedder,
        Arc::new(AcceptAll),
        WorkerSettings::from_config(&h.config),
    )
}

fn assembler(h: &Harness, publisher: Arc<dyn Publisher>) -> DigestAssembler {
    DigestAssembler::new(
        h.store.clone(),
        publisher,
        DigestSettings::from_config(&h.config),
    )
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_strict_duplicate_across_channels_yields_one_entry() {
    let h = harness("").await;
    let base = now_secs() - Duration::minutes(30);
    let first = ingest(
        h.store.as_ref(),
        "@wire",
        1,
        base,
        "Storm hits the coast https://news.example/a?utm_source=tg",
    )
    .await;
    let second = ingest(
        h.store.as_ref(),
        "@local",
        7,
        base + Duration::minutes(1),
        "storm   hits the COAST https://news.example/a",
    )
    .await;

    let enricher = Arc::new(EchoEnricher::new());
    let w = worker(&h, enricher.clone(), true);
    let report = w.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.completed, 2);
    // The second message is served from the summary cache.
    assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);

    let canonical = h.store.get_item_by_raw_message(first).await.unwrap().unwrap();
    let duplicate = h.store.get_item_by_raw_message(second).await.unwrap().unwrap();
    assert_eq!(canonical.duplicate_of_item_id, None);
    assert_eq!(duplicate.duplicate_of_item_id, Some(canonical.id));

    let window = Window::new(base - Duration::hours(1), base + Duration::hours(1)).unwrap();
    let cancel = CancellationToken::new();
    ClusteringEngine::from_config(h.store.clone(), &h.config)
        .rebuild(&window, &cancel)
        .await
        .unwrap();

    let publisher = Arc::new(RecordingPublisher::new(false));
    let outcome = assembler(&h, publisher.clone())
        .assemble(&window, &cancel)
        .await
        .unwrap();
    assert!(matches!(outcome, DigestOutcome::Published { entries: 1, items: 2, .. }));

    let entries = publisher.last.lock().unwrap().clone();
    assert_eq!(entries.len(), 1);
    let sources: Vec<(String, i64)> = entries[0]
        .sources
        .iter()
        .map(|s| (s.channel.clone(), s.msg_id))
        .collect();
    assert_eq!(sources, vec![("@wire".to_string(), 1), ("@local".to_string(), 7)]);

    let duplicate = h.store.get_item(duplicate.id).await.unwrap().unwrap();
    assert_eq!(duplicate.status, ItemStatus::Digested);
}

#[tokio::test]
async fn test_retry_ladder_backs_off_then_succeeds() {
    let h = harness("").await;
    let raw = ingest(h.store.as_ref(), "@c", 1, now_secs(), "Election results delayed").await;

    let enricher = Arc::new(FlakyEnricher {
        remaining: AtomicUsize::new(4),
        inner: EchoEnricher::new(),
    });
    let w = worker(&h, enricher, false);
    let cancel = CancellationToken::new();
    let base = h.config.retry.base_backoff_secs;

    for k in 1..=4u32 {
        let before = Utc::now();
        let report = w.tick(&cancel).await.unwrap();
        assert_eq!(report.retrying, 1, "attempt {}", k);

        let item = h.store.get_item_by_raw_message(raw).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Error);
        assert_eq!(item.retry_count, k);
        let expected = (base * (1 << (k - 1))) as f64;
        let actual = (item.next_retry_at.unwrap() - before).num_seconds() as f64;
        assert!(
            (actual - expected).abs() <= expected * 0.1,
            "attempt {}: backoff {}s, expected ~{}s",
            k,
            actual,
            expected
        );

        // Not eligible before next_retry_at.
        assert_eq!(w.tick(&cancel).await.unwrap().claimed, 0);

        sqlx::query("UPDATE items SET next_retry_at = ? WHERE raw_message_id = ?")
            .bind(Utc::now().timestamp() - 1)
            .bind(raw)
            .execute(h.sqlite.pool())
            .await
            .unwrap();
    }

    let report = w.tick(&cancel).await.unwrap();
    assert_eq!(report.completed, 1);
    let item = h.store.get_item_by_raw_message(raw).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Ready);
    assert_eq!(item.retry_count, 4);
    let message = h.store.get_raw_message(raw).await.unwrap().unwrap();
    assert!(message.processed_at.is_some());
}

#[tokio::test]
async fn test_stuck_claims_are_recovered_and_reclaimed() {
    let h = harness("").await;
    let now = now_secs();
    for i in 0..10 {
        ingest(h.store.as_ref(), "@c", i, now - Duration::minutes(60 - i), &format!("storm update {}", i)).await;
    }

    // A worker claims everything and dies without releasing.
    let crashed = h
        .store
        .claim_pending_batch(10, 5, now - Duration::minutes(15))
        .await
        .unwrap();
    assert_eq!(crashed.len(), 10);
    assert!(h.store.claim_pending_batch(10, 5, now).await.unwrap().is_empty());

    let stale_after = h.config.stale_claim_after();
    // Fresh claims are left alone.
    assert_eq!(
        h.store
            .recover_stuck_claims(stale_after, now - Duration::minutes(10))
            .await
            .unwrap(),
        0
    );
    assert_eq!(h.store.recover_stuck_claims(stale_after, now).await.unwrap(), 10);

    let reclaimed = h.store.claim_pending_batch(10, 5, now).await.unwrap();
    let before: HashSet<i64> = crashed.iter().map(|c| c.raw_message_id()).collect();
    let after: HashSet<i64> = reclaimed.iter().map(|c| c.raw_message_id()).collect();
    assert_eq!(before, after);

    // Hand them back and let a worker finish the job.
    for c in &reclaimed {
        h.store.release_claim(c.raw_message_id()).await.unwrap();
    }
    let report = worker(&h, Arc::new(EchoEnricher::new()), false)
        .tick(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.completed, 10);
    let counts = h.store.pipeline_counts().await.unwrap();
    assert_eq!(counts.unprocessed, 0);
    assert_eq!(counts.claimed, 0);
}

#[tokio::test]
async fn test_item_saved_before_failure_is_resumed_and_deduplicated() {
    let h = harness("").await;
    let now = now_secs();
    let text = "Storm closes the harbour";
    let first = ingest(h.store.as_ref(), "@wire", 1, now - Duration::minutes(30), text).await;
    let released = ingest(h.store.as_ref(), "@local", 2, now - Duration::minutes(20), text).await;
    let abandoned = ingest(h.store.as_ref(), "@radio", 3, now - Duration::minutes(10), text).await;

    let enricher = Arc::new(EchoEnricher::new());
    let w = worker(&h, enricher.clone(), true);

    // Only the first message goes through cleanly.
    let claims = h.store.claim_pending_batch(3, 5, now).await.unwrap();
    assert_eq!(claims.len(), 3);
    for c in &claims[1..] {
        h.store.release_claim(c.raw_message_id()).await.unwrap();
    }
    let outcome = w
        .process_claim(claims.into_iter().next().unwrap(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Enriched { .. }));
    let canonical = h.store.get_item_by_raw_message(first).await.unwrap().unwrap();

    // The other two get as far as `save_item`. One attempt hands its claim
    // back on the error path, the other dies holding it.
    let claimed_at = now - Duration::hours(2);
    let claims = h.store.claim_pending_batch(2, 5, claimed_at).await.unwrap();
    assert_eq!(claims.len(), 2);
    for c in &claims {
        let enrichment = Enrichment {
            topic: "storm".into(),
            summary: text.into(),
            language: "en".into(),
            relevance: 0.9,
            importance: 0.8,
        };
        h.store
            .save_item(&NewItem::from_enrichment(&c.message, &enrichment))
            .await
            .unwrap();
    }
    h.store.release_claim(released).await.unwrap();
    assert_eq!(
        h.store
            .recover_stuck_claims(h.config.stale_claim_after(), now)
            .await
            .unwrap(),
        1
    );

    let report = w.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.completed, 2);
    assert_eq!(w.stats().resumed, 2);
    assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);

    for raw in [released, abandoned] {
        let message = h.store.get_raw_message(raw).await.unwrap().unwrap();
        assert!(message.processed_at.is_some());
        let item = h.store.get_item_by_raw_message(raw).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Ready);
        assert_eq!(item.duplicate_of_item_id, Some(canonical.id));
    }

    let counts = h.store.pipeline_counts().await.unwrap();
    assert_eq!(counts.unprocessed, 0);
    assert!(h.store.claim_pending_batch(10, 5, now).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_digest_assembly_publishes_once() {
    let h = harness("").await;
    let base = now_secs() - Duration::hours(2);
    ingest(h.store.as_ref(), "@a", 1, base, "Storm warning issued").await;
    ingest(h.store.as_ref(), "@b", 2, base + Duration::minutes(5), "Election debate tonight").await;
    ingest(h.store.as_ref(), "@c", 3, base + Duration::minutes(9), "Match postponed by rain").await;
    worker(&h, Arc::new(EchoEnricher::new()), true)
        .tick(&CancellationToken::new())
        .await
        .unwrap();

    let window = Window::new(base, base + Duration::hours(1)).unwrap();
    let publisher = Arc::new(RecordingPublisher::new(false));
    let a = assembler(&h, publisher.clone());
    let b = assembler(&h, publisher.clone());
    let cancel = CancellationToken::new();

    let (ra, rb) = tokio::join!(a.assemble(&window, &cancel), b.assemble(&window, &cancel));
    let outcomes = [ra.unwrap(), rb.unwrap()];
    let published = outcomes
        .iter()
        .filter(|o| matches!(o, DigestOutcome::Published { .. }))
        .count();
    assert_eq!(published, 1, "outcomes: {:?}", outcomes);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);

    // Later invocations are no-ops.
    let again = a.assemble(&window, &cancel).await.unwrap();
    assert_eq!(again, DigestOutcome::AlreadyExists);

    let digest = h.store.get_digest(&window).await.unwrap().unwrap();
    assert_eq!(digest.status, DigestStatus::Posted);
    let counts = h.store.pipeline_counts().await.unwrap();
    assert_eq!(counts.digests_posted, 1);
    assert_eq!(counts.digested, 3);
    assert_eq!(counts.ready, 0);

    let entries = h.store.get_digest_entries(digest.id).await.unwrap();
    let covered: Vec<i64> = entries.iter().flat_map(|e| e.item_ids.clone()).collect();
    let unique: HashSet<i64> = covered.iter().copied().collect();
    assert_eq!(covered.len(), 3);
    assert_eq!(unique.len(), 3);
}

#[tokio::test]
async fn test_failed_publication_waits_for_grace_or_clear() {
    let h = harness("").await;
    let base = now_secs() - Duration::hours(2);
    ingest(h.store.as_ref(), "@a", 1, base, "Storm warning issued").await;
    worker(&h, Arc::new(EchoEnricher::new()), true)
        .tick(&CancellationToken::new())
        .await
        .unwrap();

    let window = Window::new(base, base + Duration::hours(1)).unwrap();
    let cancel = CancellationToken::new();
    let broken = Arc::new(RecordingPublisher::new(true));
    let outcome = assembler(&h, broken).assemble(&window, &cancel).await.unwrap();
    assert!(matches!(outcome, DigestOutcome::Failed { .. }));

    let healthy = Arc::new(RecordingPublisher::new(false));
    let retry = assembler(&h, healthy.clone());
    assert_eq!(
        retry.assemble(&window, &cancel).await.unwrap(),
        DigestOutcome::AlreadyExists
    );
    assert_eq!(healthy.calls.load(Ordering::SeqCst), 0);

    assert_eq!(h.store.clear_digest_errors().await.unwrap(), 1);
    let outcome = retry.assemble(&window, &cancel).await.unwrap();
    assert!(matches!(outcome, DigestOutcome::Published { .. }));
    assert_eq!(
        h.store.get_digest(&window).await.unwrap().unwrap().status,
        DigestStatus::Posted
    );
}

#[tokio::test]
async fn test_intra_channel_burst_collapses_to_one_item() {
    let h = harness("").await;
    let base = now_secs() - Duration::minutes(20);
    let texts = [
        "Storm makes landfall near the harbour",
        "STORM: landfall confirmed at the harbour",
        "Storm update: harbour hit, power out",
        "More on the storm at the harbour",
        "Storm latest: harbour flooding",
    ];
    let mut raws = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        raws.push(ingest(h.store.as_ref(), "@coast", i as i64 + 1, base + Duration::minutes(i as i64), text).await);
    }

    let report = worker(&h, Arc::new(EchoEnricher::new()), true)
        .tick(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.completed, 5);

    let canonical = h.store.get_item_by_raw_message(raws[0]).await.unwrap().unwrap();
    assert_eq!(canonical.duplicate_of_item_id, None);
    for raw in &raws[1..] {
        let item = h.store.get_item_by_raw_message(*raw).await.unwrap().unwrap();
        assert_eq!(item.duplicate_of_item_id, Some(canonical.id));
    }

    let window = Window::new(base, base + Duration::hours(1)).unwrap();
    let a = assembler(&h, Arc::new(RecordingPublisher::new(false)));
    let entries = a.build(&window).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sources.len(), 5);
    assert_eq!(entries[0].body, texts[0]);
}

#[tokio::test]
async fn test_item_at_window_end_belongs_to_next_window() {
    let h = harness("").await;
    let start = now_secs() - Duration::hours(3);
    let end = start + Duration::hours(1);
    ingest(h.store.as_ref(), "@a", 1, end - Duration::seconds(1), "Storm inside").await;
    ingest(h.store.as_ref(), "@b", 2, end, "Election on the boundary").await;
    worker(&h, Arc::new(EchoEnricher::new()), true)
        .tick(&CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let publisher = Arc::new(RecordingPublisher::new(false));
    let first = Window::new(start, end).unwrap();
    let outcome = assembler(&h, publisher.clone())
        .assemble(&first, &cancel)
        .await
        .unwrap();
    assert!(matches!(outcome, DigestOutcome::Published { items: 1, .. }));
    assert_eq!(publisher.last.lock().unwrap()[0].sources[0].msg_id, 1);

    let next = Window::new(end, end + Duration::hours(1)).unwrap();
    let outcome = assembler(&h, publisher.clone())
        .assemble(&next, &cancel)
        .await
        .unwrap();
    assert!(matches!(outcome, DigestOutcome::Published { items: 1, .. }));
    assert_eq!(publisher.last.lock().unwrap()[0].sources[0].msg_id, 2);
}

#[tokio::test]
async fn test_concurrent_claims_are_disjoint() {
    let h = harness("").await;
    let now = now_secs();
    for i in 0..20 {
        ingest(h.store.as_ref(), "@c", i, now - Duration::seconds(100 - i), &format!("match report {}", i)).await;
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = h.store.clone();
        handles.push(tokio::spawn(async move {
            store.claim_pending_batch(5, 5, now).await.unwrap()
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        let claims = handle.await.unwrap();
        let dates: Vec<_> = claims.iter().map(|c| c.message.source_date).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted, "claims are ordered by source date");
        for c in claims {
            total += 1;
            seen.insert(c.raw_message_id());
        }
    }
    assert_eq!(total, 20);
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn test_store_idempotence_laws() {
    let h = harness("").await;
    let at = now_secs() - Duration::minutes(5);
    let raw = ingest(h.store.as_ref(), "@c", 1, at, "Storm").await;
    let item = NewItem {
        raw_message_id: raw,
        relevance_score: 0.8,
        importance_score: 0.9,
        topic: "storm".into(),
        summary: "Storm".into(),
        language: "en".into(),
        first_seen_at: at,
    };

    let id1 = h.store.save_item(&item).await.unwrap();
    let id2 = h.store.save_item(&item).await.unwrap();
    assert_eq!(id1, id2);
    assert_eq!(h.store.pipeline_counts().await.unwrap().ready, 1);

    let first = now_secs();
    h.store.mark_processed(raw, first).await.unwrap();
    h.store
        .mark_processed(raw, first + Duration::minutes(5))
        .await
        .unwrap();
    let message = h.store.get_raw_message(raw).await.unwrap().unwrap();
    assert_eq!(message.processed_at, Some(first));
    assert_eq!(message.processing_started_at, None);

    let window = Window::new(at - Duration::hours(1), at + Duration::hours(1)).unwrap();
    let cluster = h
        .store
        .create_cluster(&window, Some("storm"), first)
        .await
        .unwrap();
    h.store.add_to_cluster(cluster, id1).await.unwrap();
    h.store.add_to_cluster(cluster, id1).await.unwrap();
    let clusters = h.store.load_window_clusters(&window).await.unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].item_ids, vec![id1]);
}

#[tokio::test]
async fn test_worker_pool_drains_queue_until_cancelled() {
    let h = harness("workers = 3").await;
    let now = now_secs();
    for i in 0..12 {
        ingest(
            h.store.as_ref(),
            &format!("@ch{}", i % 4),
            i,
            now - Duration::minutes(30 - i),
            &format!("bulletin number {}", i),
        )
        .await;
    }

    let pool = Arc::new(worker(&h, Arc::new(EchoEnricher::new()), false));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pool.clone().run(cancel.clone()));

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let counts = h.store.pipeline_counts().await.unwrap();
        if counts.unprocessed == 0 && counts.claimed == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue not drained: {:?}", counts);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let stats = pool.stats();
    assert_eq!(stats.enriched, 12);
    assert_eq!(stats.failed, 0);
    let counts = h.store.pipeline_counts().await.unwrap();
    assert_eq!(counts.ready, 12);
    assert_eq!(counts.duplicates, 0);
}
