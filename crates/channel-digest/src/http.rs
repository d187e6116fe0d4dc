//! Shared HTTP plumbing for the provider and publisher clients.
//!
//! Maps transport outcomes onto the typed provider errors:
//! - HTTP 429 → [`ProviderError::RateLimited`]
//! - HTTP 5xx, network errors, timeouts → [`ProviderError::Transient`]
//! - other HTTP 4xx, unparseable bodies → [`ProviderError::Permanent`]

use reqwest::StatusCode;
use std::time::Duration;

use channel_digest_core::error::ProviderError;

/// Default base URL for OpenAI-compatible APIs.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub fn client(timeout_secs: u64) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ProviderError::Permanent(format!("failed to build HTTP client: {}", e)))
}

pub fn classify_status(service: &str, status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{} API error {}: {}", service, status, truncate(body, 512));
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited(message)
    } else if status.is_server_error() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

pub fn classify_transport(service: &str, err: &reqwest::Error) -> ProviderError {
    if err.is_builder() {
        ProviderError::Permanent(format!("{} request invalid: {}", service, err))
    } else {
        ProviderError::Transient(format!("{} request failed: {}", service, err))
    }
}

/// Exponential backoff between client-side retries: 1s, 2s, 4s, … 32s.
pub fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

/// `OPENAI_API_KEY` from the environment.
pub fn openai_api_key() -> Result<String, ProviderError> {
    std::env::var("OPENAI_API_KEY")
        .map_err(|_| ProviderError::Permanent("OPENAI_API_KEY environment variable not set".into()))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
