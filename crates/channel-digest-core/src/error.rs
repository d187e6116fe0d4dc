//! Typed errors at the pipeline's external boundaries.
//!
//! Store operations return `anyhow::Result`; the adapters (enrichment,
//! embeddings, publication) and the summary cache return the typed errors
//! below so callers can pick a retry policy by kind.

use thiserror::Error;

/// Failure reported by an enrichment or embedding provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, timeout, or provider 5xx.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The provider asked us to slow down (HTTP 429).
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    /// Invalid input or a response that can never succeed.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The surrounding operation was cancelled.
    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Transient and rate-limited failures are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transient(_) => "transient",
            ProviderError::RateLimited(_) => "rate_limited",
            ProviderError::Permanent(_) => "permanent",
            ProviderError::Cancelled => "cancelled",
        }
    }
}

/// Failure reported by a digest transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("transient publish error: {0}")]
    Transient(String),

    #[error("permanent publish error: {0}")]
    Permanent(String),

    #[error("publish cancelled")]
    Cancelled,
}

/// Summary cache lookup failure.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No entry for the `(canonical_hash, digest_language)` key.
    #[error("summary cache entry not found")]
    NotFound,

    #[error("summary cache storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Engine-level failure that aborts a worker tick, clustering run or digest.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
