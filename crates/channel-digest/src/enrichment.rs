//! Enrichment provider implementations.
//!
//! - **[`DisabledEnricher`]**: always fails permanently.
//! - **[`OpenAIEnricher`]**: OpenAI-compatible `/chat/completions` client
//!   asking for a JSON object with `topic`, `summary`, `language`,
//!   `relevance` and `importance`.
//!
//! The enricher makes a single attempt per call; retries are scheduled by
//! the worker pool through the item's `next_retry_at`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use channel_digest_core::error::ProviderError;
use channel_digest_core::models::Enrichment;
use channel_digest_core::provider::{Enricher, EnrichmentRequest};

use crate::config::EnrichmentConfig;
use crate::http;

const SYSTEM_PROMPT: &str = "You triage posts from news channels for a daily digest. \
Reply with a single JSON object with the keys: \
\"topic\" (two to five words), \
\"summary\" (one or two sentences), \
\"language\" (ISO 639-1 code of the post), \
\"relevance\" (0.0 to 1.0, how newsworthy the post is), \
\"importance\" (0.0 to 1.0, how prominently it belongs in the digest).";

pub struct DisabledEnricher;

#[async_trait]
impl Enricher for DisabledEnricher {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn enrich(&self, _request: &EnrichmentRequest) -> Result<Enrichment, ProviderError> {
        Err(ProviderError::Permanent(
            "Enrichment provider is disabled. Set [enrichment] provider in config.".into(),
        ))
    }
}

/// Chat-completions enricher. Requires `OPENAI_API_KEY`.
pub struct OpenAIEnricher {
    model: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIEnricher {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("enrichment.model required for OpenAI provider"))?;
        let base = config.url.as_deref().unwrap_or(http::OPENAI_BASE_URL);
        let api_key = http::openai_api_key()?;
        let client = http::client(config.timeout_secs)?;

        Ok(Self {
            model,
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Enricher for OpenAIEnricher {
    fn name(&self) -> &str {
        &self.model
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<Enrichment, ProviderError> {
        if request.text.trim().is_empty() {
            return Err(ProviderError::Permanent("message has no text".into()));
        }

        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt(request)},
            ],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| http::classify_transport("OpenAI", &e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(http::classify_status("OpenAI", status, &body_text));
        }

        let json: serde_json::Value = response.json().await.map_err(|e| {
            ProviderError::Permanent(format!("OpenAI response is not JSON: {}", e))
        })?;
        parse_completion(&json, request.language_hint.as_deref())
    }
}

fn user_prompt(request: &EnrichmentRequest) -> String {
    let mut prompt = format!("Channel: {}\n", request.channel_context);
    if let Some(lang) = &request.language_hint {
        prompt.push_str(&format!("Write topic and summary in language: {}\n", lang));
    }
    prompt.push_str("Post:\n");
    prompt.push_str(&request.text);
    prompt
}

#[derive(Debug, Deserialize)]
struct EnrichmentReply {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    relevance: f64,
    #[serde(default)]
    importance: f64,
}

/// Extract and validate the JSON object in `choices[0].message.content`.
fn parse_completion(
    json: &serde_json::Value,
    language_hint: Option<&str>,
) -> Result<Enrichment, ProviderError> {
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            ProviderError::Permanent("Invalid OpenAI response: missing message content".into())
        })?;

    let reply: EnrichmentReply = serde_json::from_str(strip_code_fence(content)).map_err(|e| {
        ProviderError::Permanent(format!("enrichment reply is not the expected JSON: {}", e))
    })?;

    if reply.summary.trim().is_empty() {
        return Err(ProviderError::Permanent("enrichment reply has an empty summary".into()));
    }

    let language = reply
        .language
        .filter(|l| !l.trim().is_empty())
        .or_else(|| language_hint.map(str::to_string))
        .unwrap_or_default();

    Ok(Enrichment {
        topic: reply.topic.trim().to_string(),
        summary: reply.summary.trim().to_string(),
        language,
        relevance: reply.relevance,
        importance: reply.importance,
    }
    .clamped())
}

/// Models occasionally wrap JSON in a Markdown fence.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            rest.strip_suffix("```").unwrap_or(rest).trim()
        }
        None => trimmed,
    }
}

/// Create an enricher from config: `"disabled"` or `"openai"`.
pub fn create_enricher(config: &EnrichmentConfig) -> Result<Arc<dyn Enricher>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEnricher)),
        "openai" => Ok(Arc::new(OpenAIEnricher::new(config)?)),
        other => bail!("Unknown enrichment provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completion(content: &str) -> serde_json::Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    #[test]
    fn test_parse_completion_clamps_scores() {
        let body = completion(
            r#"{"topic":" Elections ","summary":"Polls closed.","language":"en","relevance":1.4,"importance":-0.2}"#,
        );
        let e = parse_completion(&body, None).unwrap();
        assert_eq!(e.topic, "Elections");
        assert_eq!(e.relevance, 1.0);
        assert_eq!(e.importance, 0.0);
    }

    #[test]
    fn test_parse_completion_fenced_and_language_fallback() {
        let body = completion("```json\n{\"topic\":\"x\",\"summary\":\"y\",\"relevance\":0.5,\"importance\":0.5}\n```");
        let e = parse_completion(&body, Some("de")).unwrap();
        assert_eq!(e.language, "de");
        assert_eq!(e.summary, "y");
    }

    #[test]
    fn test_parse_completion_garbage_is_permanent() {
        let err = parse_completion(&completion("I cannot help with that"), None).unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
        let err = parse_completion(&json!({"choices": []}), None).unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }

    #[test]
    fn test_user_prompt_carries_context() {
        let request = EnrichmentRequest {
            text: "Hello".into(),
            channel_context: "@news".into(),
            language_hint: Some("fr".into()),
        };
        let prompt = user_prompt(&request);
        assert!(prompt.contains("@news"));
        assert!(prompt.contains("fr"));
        assert!(prompt.ends_with("Hello"));
    }

    #[tokio::test]
    async fn test_disabled_enricher() {
        let enricher = create_enricher(&EnrichmentConfig::default()).unwrap();
        let request = EnrichmentRequest {
            text: "x".into(),
            channel_context: "c".into(),
            language_hint: None,
        };
        assert!(!enricher.enrich(&request).await.unwrap_err().is_retryable());
    }
}
