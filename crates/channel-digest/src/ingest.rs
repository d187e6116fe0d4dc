//! JSONL ingestion of upstream messages.
//!
//! Each line is one message:
//!
//! ```json
//! {"channel":"@news","source_message_id":42,"source_date":"2026-10-01T12:00:00Z","text":"…"}
//! ```
//!
//! Optional keys: `entities_json`, `media_json`, `forwarded_from`. The
//! canonical hash is always recomputed from `text`. Re-ingesting a message
//! updates its content and leaves its processing state alone.

use anyhow::{Context, Result};
use std::io::{BufRead, Read};
use std::path::Path;

use channel_digest_core::models::NewRawMessage;
use channel_digest_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub lines: usize,
    pub upserted: usize,
    pub skipped: usize,
}

/// Parse one JSONL line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<NewRawMessage>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let mut msg: NewRawMessage = serde_json::from_str(trimmed)?;
    msg.canonical_hash.clear();
    Ok(Some(msg.with_computed_hash()))
}

/// Upsert every message read from `reader`.
///
/// With `strict`, the first malformed line aborts; otherwise it is logged
/// and skipped.
pub async fn ingest_reader<R: BufRead>(
    store: &dyn Store,
    reader: R,
    strict: bool,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();

    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("Failed to read line {}", line_no))?;
        report.lines += 1;

        let msg = match parse_line(&line) {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) if strict => return Err(e.context(format!("Invalid message on line {}", line_no))),
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "skipping malformed message");
                report.skipped += 1;
                continue;
            }
        };

        store
            .upsert_raw_message(&msg)
            .await
            .with_context(|| format!("Failed to store message on line {}", line_no))?;
        report.upserted += 1;
    }

    Ok(report)
}

/// `cdg ingest <path>`; `-` reads stdin.
pub async fn run_ingest(config: &Config, path: &Path, strict: bool) -> Result<()> {
    let store = SqliteStore::connect(config).await?;

    let report = if path == Path::new("-") {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read stdin")?;
        ingest_reader(&store, input.as_bytes(), strict).await?
    } else {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        ingest_reader(&store, std::io::BufReader::new(file), strict).await?
    };

    println!("ingest {}", path.display());
    println!("  lines: {}", report.lines);
    println!("  upserted: {}", report.upserted);
    println!("  skipped: {}", report.skipped);

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel_digest_core::canonical::canonical_hash;
    use channel_digest_core::store::memory::InMemoryStore;

    const SAMPLE: &str = r#"{"channel":"@news","source_message_id":1,"source_date":"2026-10-01T12:00:00Z","text":"Hello  World"}

{"channel":"@news","source_message_id":2,"source_date":"2026-10-01T12:05:00Z","text":"Fwd","forwarded_from":"@other","canonical_hash":"bogus"}
"#;

    #[test]
    fn test_parse_line_recomputes_hash() {
        let line = SAMPLE.lines().nth(2).unwrap();
        let msg = parse_line(line).unwrap().unwrap();
        assert_eq!(msg.canonical_hash, canonical_hash("Fwd"));
        assert_eq!(msg.forwarded_from.as_deref(), Some("@other"));
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let store = InMemoryStore::new();
        let first = ingest_reader(&store, SAMPLE.as_bytes(), true).await.unwrap();
        assert_eq!(first.upserted, 2);
        ingest_reader(&store, SAMPLE.as_bytes(), true).await.unwrap();
        assert_eq!(store.pipeline_counts().await.unwrap().raw_messages, 2);
    }

    #[tokio::test]
    async fn test_malformed_line_handling() {
        let input = "{\"channel\":\"@a\"}\n";
        let store = InMemoryStore::new();
        assert!(ingest_reader(&store, input.as_bytes(), true).await.is_err());
        let report = ingest_reader(&store, input.as_bytes(), false).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.upserted, 0);
    }
}
