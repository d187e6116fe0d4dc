//! Digest assembler: at most one posted digest per window.
//!
//! Assembly for a window runs under the advisory lock derived from
//! [`Window::lock_key`]:
//!
//! 1. Skip if a posted digest exists, or a failed attempt is younger than
//!    the retry grace interval.
//! 2. Load ready items, the window's clusters and the duplicates pointing
//!    at those items; build the ordered entries.
//! 3. Publish. On success, the digest row, its entries and the digested
//!    marks are written in one transaction. On failure an `error` row is
//!    recorded so the window is retried after the grace interval.
//!
//! An empty window publishes nothing and records nothing.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use channel_digest_core::digest::{build_entries, covered_item_ids};
use channel_digest_core::error::{PipelineError, PipelineResult, PublishError};
use channel_digest_core::models::{DigestEntry, Window};
use channel_digest_core::provider::{Published, Publisher};
use channel_digest_core::store::Store;

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct DigestSettings {
    pub chat_id: String,
    pub language: Option<String>,
    pub importance_threshold: f64,
    pub retry_grace: Duration,
    pub lock_ttl: Duration,
    pub max_items: usize,
    pub publish_timeout: std::time::Duration,
}

impl DigestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chat_id: config.digest.chat_id.clone(),
            language: config.digest.language.clone(),
            importance_threshold: config.digest.importance_threshold,
            retry_grace: Duration::seconds(config.digest.retry_grace_secs),
            lock_ttl: Duration::seconds(config.digest.lock_ttl_secs),
            max_items: config.clustering.max_items,
            publish_timeout: std::time::Duration::from_secs(config.publisher.timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DigestOutcome {
    /// Another assembler holds the window's lock.
    Locked,
    /// Posted already, or a recent failure is still inside its grace interval.
    AlreadyExists,
    /// No eligible items in the window.
    Empty,
    Published {
        digest_id: i64,
        chat_id: String,
        message_id: String,
        entries: usize,
        items: usize,
    },
    Failed {
        error: String,
    },
}

pub struct DigestAssembler {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    settings: DigestSettings,
}

impl DigestAssembler {
    pub fn new(store: Arc<dyn Store>, publisher: Arc<dyn Publisher>, settings: DigestSettings) -> Self {
        Self {
            store,
            publisher,
            settings,
        }
    }

    /// Assemble and publish the digest for `window`.
    pub async fn assemble(
        &self,
        window: &Window,
        cancel: &CancellationToken,
    ) -> PipelineResult<DigestOutcome> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let lock_id = window.lock_key();
        // Whole seconds, as the store keeps them.
        let acquired_at =
            DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_else(Utc::now);
        if !self
            .store
            .try_acquire_lock(lock_id, self.settings.lock_ttl, acquired_at)
            .await?
        {
            tracing::info!(window = %window, "digest window locked by another assembler");
            return Ok(DigestOutcome::Locked);
        }

        let result = self.assemble_locked(window, cancel).await;

        if let Err(e) = self.store.release_lock(lock_id, acquired_at).await {
            tracing::warn!(window = %window, error = %e, "failed to release digest lock; it expires after the lock TTL");
        }
        result
    }

    async fn assemble_locked(
        &self,
        window: &Window,
        cancel: &CancellationToken,
    ) -> PipelineResult<DigestOutcome> {
        if self
            .store
            .digest_exists(window, self.settings.retry_grace, Utc::now())
            .await?
        {
            tracing::debug!(window = %window, "digest already exists");
            return Ok(DigestOutcome::AlreadyExists);
        }

        let entries = self.build(window).await?;
        if entries.is_empty() {
            tracing::info!(window = %window, "no eligible items; nothing to publish");
            return Ok(DigestOutcome::Empty);
        }

        let chat_id = self.settings.chat_id.as_str();
        match self.publish(chat_id, &entries, cancel).await {
            Ok(published) => {
                let digest_id = self
                    .store
                    .record_published_digest(
                        window,
                        &published.chat_id,
                        &published.message_id,
                        &entries,
                        Utc::now(),
                    )
                    .await?;
                let items = covered_item_ids(&entries).len();
                tracing::info!(
                    window = %window,
                    digest_id,
                    chat_id = %published.chat_id,
                    message_id = %published.message_id,
                    entries = entries.len(),
                    items,
                    "digest published"
                );
                Ok(DigestOutcome::Published {
                    digest_id,
                    chat_id: published.chat_id,
                    message_id: published.message_id,
                    entries: entries.len(),
                    items,
                })
            }
            Err(PublishError::Cancelled) => Err(PipelineError::Cancelled),
            Err(err) => {
                let error = err.to_string();
                self.store
                    .save_digest_error(window, chat_id, &error, Utc::now())
                    .await?;
                tracing::error!(window = %window, publisher = self.publisher.name(), error = %error, "digest publication failed");
                Ok(DigestOutcome::Failed { error })
            }
        }
    }

    /// Ordered entries for `window`, without publishing anything.
    pub async fn build(&self, window: &Window) -> PipelineResult<Vec<DigestEntry>> {
        let items = self
            .store
            .load_window_items(
                window,
                self.settings.importance_threshold,
                self.settings.max_items,
            )
            .await?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let clusters = self.store.load_window_clusters(window).await?;
        let ids: Vec<i64> = items.iter().map(|i| i.item_id).collect();
        let duplicates = self.store.load_duplicates_of(&ids).await?;
        Ok(build_entries(&items, &clusters, &duplicates))
    }

    async fn publish(
        &self,
        chat_id: &str,
        entries: &[DigestEntry],
        cancel: &CancellationToken,
    ) -> Result<Published, PublishError> {
        let call = self
            .publisher
            .publish(chat_id, self.settings.language.as_deref(), entries);
        tokio::select! {
            _ = cancel.cancelled() => Err(PublishError::Cancelled),
            result = tokio::time::timeout(self.settings.publish_timeout, call) => match result {
                Ok(r) => r,
                Err(_) => Err(PublishError::Transient(format!(
                    "publish timed out after {}s",
                    self.settings.publish_timeout.as_secs()
                ))),
            },
        }
    }
}
