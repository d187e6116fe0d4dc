//! Adapter traits for the pipeline's external collaborators.
//!
//! | Trait | Used by | Contract |
//! |-------|---------|----------|
//! | [`Enricher`] | worker pool | text + context → [`Enrichment`] or [`ProviderError`] |
//! | [`Publisher`] | digest assembler | entries → `(chat_id, message_id)` or [`PublishError`] |
//! | [`MessageFilter`] | worker pool | raw message → optional drop reason |
//!
//! The embedding contract lives in [`crate::embedding::EmbeddingProvider`].

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{ProviderError, PublishError};
use crate::models::{DigestEntry, Enrichment, RawMessage};

/// Input to an enrichment call.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRequest {
    pub text: String,
    /// Source channel the message came from.
    pub channel_context: String,
    /// Language the summary should be written in.
    pub language_hint: Option<String>,
}

impl EnrichmentRequest {
    pub fn for_message(message: &RawMessage, language_hint: Option<&str>) -> Self {
        Self {
            text: message.text.clone(),
            channel_context: message.channel.clone(),
            language_hint: language_hint.map(str::to_string),
        }
    }
}

/// Language-model service that scores and summarizes a message.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<Enrichment, ProviderError>;
}

/// Identifiers of a published digest message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Published {
    pub chat_id: String,
    pub message_id: String,
}

/// Subscriber transport for assembled digests.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;
    async fn publish(
        &self,
        chat_id: &str,
        language: Option<&str>,
        entries: &[DigestEntry],
    ) -> Result<Published, PublishError>;
}

/// Content gate consulted before enrichment.
pub trait MessageFilter: Send + Sync {
    /// Returns the reason to drop `message`, or `None` to keep it.
    fn should_filter(&self, message: &RawMessage) -> Option<String>;
}

/// A filter that keeps everything.
pub struct AcceptAll;

impl MessageFilter for AcceptAll {
    fn should_filter(&self, _message: &RawMessage) -> Option<String> {
        None
    }
}
