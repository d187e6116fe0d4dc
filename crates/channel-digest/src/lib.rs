//! # Channel Digest
//!
//! A message enrichment and digest pipeline for upstream content channels.
//!
//! Ingested messages are claimed by a pool of concurrent workers, scored and
//! summarised by a language-model provider, embedded, deduplicated against
//! recent items, clustered per time window, and published as one digest
//! per window, at most once.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────┐
//! │  Ingest  │──▶│   SQLite     │◀──│  Workers   │──▶ enricher / embedder
//! │  (JSONL) │   │ claims+items │   │ claim+dedup│
//! └──────────┘   └──────┬───────┘   └────────────┘
//!                       │
//!          ┌────────────┼───────────────┐
//!          ▼            ▼               ▼
//!    ┌──────────┐ ┌───────────┐   ┌──────────┐
//!    │ Cluster  │▶│ Assembler │──▶│Publisher │
//!    │ (window) │ │ (lock+tx) │   │ log/hook │
//!    └──────────┘ └───────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cdg init                          # create database
//! cdg ingest messages.jsonl         # load upstream messages
//! cdg work                          # run the enrichment pool
//! cdg digest --last-hours 6         # cluster + publish one window
//! cdg serve                         # status endpoints
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the storage gateway |
//! | [`enrichment`] | Enrichment providers |
//! | [`embedding`] | Embedding providers |
//! | [`publisher`] | Digest transports |
//! | [`filter`] | Content filter gate |
//! | [`worker`] | Enrichment worker pool |
//! | [`clustering`] | Window clustering engine |
//! | [`assembler`] | Digest assembler |
//! | [`server`] | Status HTTP server |

pub mod assembler;
pub mod clustering;
pub mod config;
pub mod db;
pub mod digest_cmd;
pub mod embed_cmd;
pub mod embedding;
pub mod enrichment;
pub mod filter;
mod http;
pub mod ingest;
pub mod migrate;
pub mod publisher;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod work_cmd;
pub mod worker;
