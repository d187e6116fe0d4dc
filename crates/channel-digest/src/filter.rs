//! Content filter applied before enrichment.
//!
//! Rules are checked in order and the first hit wins:
//!
//! 1. `skip_forwards`: the message was forwarded from another chat.
//! 2. `min_length`: fewer non-whitespace characters than configured.
//! 3. `denylist`: any regex matches the text.

use anyhow::{Context, Result};
use regex::Regex;

use channel_digest_core::models::RawMessage;
use channel_digest_core::provider::MessageFilter;

use crate::config::FiltersConfig;

pub struct ContentFilter {
    min_length: usize,
    skip_forwards: bool,
    denylist: Vec<Regex>,
}

impl ContentFilter {
    pub fn new(config: &FiltersConfig) -> Result<Self> {
        let denylist = config
            .denylist
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("Invalid filters.denylist pattern: {}", pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            min_length: config.min_length,
            skip_forwards: config.skip_forwards,
            denylist,
        })
    }
}

impl MessageFilter for ContentFilter {
    fn should_filter(&self, message: &RawMessage) -> Option<String> {
        if self.skip_forwards {
            if let Some(origin) = message.forwarded_from.as_deref().filter(|o| !o.is_empty()) {
                return Some(format!("forwarded from {}", origin));
            }
        }

        let length = message.text.chars().filter(|c| !c.is_whitespace()).count();
        if length < self.min_length {
            return Some(format!("too short ({} < {})", length, self.min_length));
        }

        self.denylist
            .iter()
            .find(|re| re.is_match(&message.text))
            .map(|re| format!("denylist: {}", re.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(text: &str, forwarded_from: Option<&str>) -> RawMessage {
        RawMessage {
            id: 1,
            channel: "@news".into(),
            source_message_id: 10,
            source_date: Utc::now(),
            text: text.into(),
            entities_json: None,
            media_json: None,
            forwarded_from: forwarded_from.map(str::to_string),
            canonical_hash: String::new(),
            processed_at: None,
            processing_started_at: None,
            discoveries_extracted: false,
        }
    }

    fn filter(min_length: usize, skip_forwards: bool, denylist: &[&str]) -> ContentFilter {
        ContentFilter::new(&FiltersConfig {
            min_length,
            skip_forwards,
            denylist: denylist.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_default_keeps_everything() {
        let f = filter(0, false, &[]);
        assert_eq!(f.should_filter(&message("", Some("@other"))), None);
    }

    #[test]
    fn test_min_length_ignores_whitespace() {
        let f = filter(5, false, &[]);
        assert!(f.should_filter(&message("a b  c", None)).is_some());
        assert_eq!(f.should_filter(&message("hello", None)), None);
    }

    #[test]
    fn test_forwards_suppressed() {
        let f = filter(0, true, &[]);
        let reason = f.should_filter(&message("news", Some("@other"))).unwrap();
        assert!(reason.contains("@other"));
        assert_eq!(f.should_filter(&message("news", None)), None);
    }

    #[test]
    fn test_denylist() {
        let f = filter(0, false, &[r"(?i)\bpromo code\b"]);
        assert!(f.should_filter(&message("Use PROMO CODE now", None)).is_some());
        assert_eq!(f.should_filter(&message("Storm warning", None)), None);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = FiltersConfig {
            denylist: vec!["(".into()],
            ..FiltersConfig::default()
        };
        assert!(ContentFilter::new(&config).is_err());
    }
}
