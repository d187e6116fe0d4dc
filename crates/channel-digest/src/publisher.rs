//! Digest transports.
//!
//! - **[`LogPublisher`]**: writes the digest as one JSON line to stdout.
//! - **[`WebhookPublisher`]**: POSTs the digest as JSON to a URL.
//!
//! Both return a `(chat_id, message_id)` pair that the assembler stores
//! with the digest row.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use channel_digest_core::error::{ProviderError, PublishError};
use channel_digest_core::models::DigestEntry;
use channel_digest_core::provider::{Published, Publisher};

use crate::config::PublisherConfig;
use crate::http;

#[derive(Debug, Serialize)]
struct DigestPayload<'a> {
    chat_id: &'a str,
    language: Option<&'a str>,
    entries: &'a [DigestEntry],
}

/// Prints the digest; the message id is derived from the printed content.
pub struct LogPublisher;

fn content_id(line: &str) -> String {
    let hash = Sha256::digest(line.as_bytes());
    hash[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl Publisher for LogPublisher {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(
        &self,
        chat_id: &str,
        language: Option<&str>,
        entries: &[DigestEntry],
    ) -> Result<Published, PublishError> {
        let payload = DigestPayload {
            chat_id,
            language,
            entries,
        };
        let line = serde_json::to_string(&payload)
            .map_err(|e| PublishError::Permanent(format!("failed to encode digest: {}", e)))?;
        println!("{}", line);

        Ok(Published {
            chat_id: chat_id.to_string(),
            message_id: content_id(&line),
        })
    }
}

/// POSTs `{chat_id, language, entries}` to the configured URL.
///
/// The endpoint answers `{chat_id, message_id}`. A missing `chat_id` keeps
/// the requested one; a missing `message_id` gets a random UUID.
pub struct WebhookPublisher {
    url: String,
    client: reqwest::Client,
}

impl WebhookPublisher {
    pub fn new(config: &PublisherConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("publisher.url required for webhook publisher"))?;
        let client = http::client(config.timeout_secs)?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(
        &self,
        chat_id: &str,
        language: Option<&str>,
        entries: &[DigestEntry],
    ) -> Result<Published, PublishError> {
        let payload = DigestPayload {
            chat_id,
            language,
            entries,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| to_publish_error(http::classify_transport("webhook", &e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(to_publish_error(http::classify_status(
                "webhook", status, &body_text,
            )));
        }

        let body_text = response.text().await.unwrap_or_default();
        Ok(published_from_body(&body_text, chat_id))
    }
}

fn to_publish_error(err: ProviderError) -> PublishError {
    match err {
        ProviderError::Transient(m) | ProviderError::RateLimited(m) => PublishError::Transient(m),
        ProviderError::Permanent(m) => PublishError::Permanent(m),
        ProviderError::Cancelled => PublishError::Cancelled,
    }
}

fn published_from_body(body: &str, requested_chat_id: &str) -> Published {
    let json: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
    Published {
        chat_id: id_field(&json, "chat_id").unwrap_or_else(|| requested_chat_id.to_string()),
        message_id: id_field(&json, "message_id")
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    }
}

fn id_field(json: &serde_json::Value, key: &str) -> Option<String> {
    match json.get(key)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Create a publisher from config: `"log"` or `"webhook"`.
pub fn create_publisher(config: &PublisherConfig) -> Result<Arc<dyn Publisher>> {
    match config.kind.as_str() {
        "log" => Ok(Arc::new(LogPublisher)),
        "webhook" => Ok(Arc::new(WebhookPublisher::new(config)?)),
        other => bail!("Unknown publisher kind: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_published_from_body() {
        let p = published_from_body(r#"{"chat_id":"-100","message_id":42}"#, "digest");
        assert_eq!(p.chat_id, "-100");
        assert_eq!(p.message_id, "42");

        let p = published_from_body("not json", "digest");
        assert_eq!(p.chat_id, "digest");
        assert!(!p.message_id.is_empty());
    }

    #[test]
    fn test_rate_limit_maps_to_transient() {
        assert!(matches!(
            to_publish_error(ProviderError::RateLimited("429".into())),
            PublishError::Transient(_)
        ));
        assert!(matches!(
            to_publish_error(ProviderError::Permanent("400".into())),
            PublishError::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn test_log_publisher_id_follows_content() {
        let a = LogPublisher.publish("digest", Some("en"), &[]).await.unwrap();
        let b = LogPublisher.publish("digest", Some("en"), &[]).await.unwrap();
        let c = LogPublisher.publish("digest", Some("de"), &[]).await.unwrap();
        assert_eq!(a.chat_id, "digest");
        assert_eq!(a.message_id.len(), 16);
        assert_eq!(a.message_id, b.message_id);
        assert_ne!(a.message_id, c.message_id);
    }
}
