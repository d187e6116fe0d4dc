//! # Channel Digest Core
//!
//! Runtime-agnostic logic for Channel Digest: the data model, the [`store::Store`]
//! gateway trait, adapter traits for enrichment, embedding and publication,
//! and the pure algorithms behind deduplication, clustering and digest
//! assembly.
//!
//! This crate contains no tokio, sqlx, or network dependencies. The
//! `channel-digest` app crate supplies the SQLite store, HTTP providers and
//! the worker runtime.

pub mod canonical;
pub mod cluster;
pub mod dedup;
pub mod digest;
pub mod embedding;
pub mod error;
pub mod models;
pub mod provider;
pub mod retry;
pub mod similarity;
pub mod store;
pub mod summary_cache;
