//! Canonical message fingerprints for strict-duplicate detection.
//!
//! Two messages share a canonical hash when their text is identical after
//! normalization:
//!
//! 1. URLs lose their tracking query parameters (`utm_*`, `fbclid`, …).
//! 2. Text is lower-cased.
//! 3. Runs of whitespace collapse to a single space; ends are trimmed.
//!
//! The hash is the lowercase hex SHA-256 of the normalized text.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "yclid", "mc_cid", "mc_eid", "ref"];

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s]+").expect("static regex"))
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Remove tracking parameters from a single URL, keeping the fragment.
fn strip_trackers(url: &str) -> String {
    let (without_fragment, fragment) = match url.split_once('#') {
        Some((u, f)) => (u, Some(f)),
        None => (url, None),
    };
    let (base, query) = match without_fragment.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (without_fragment, None),
    };

    let mut out = base.to_string();
    if let Some(query) = query {
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter(|pair| {
                let key = pair.split('=').next().unwrap_or("");
                !is_tracking_param(key)
            })
            .collect();
        if !kept.is_empty() {
            out.push('?');
            out.push_str(&kept.join("&"));
        }
    }
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

/// Normalize message text for fingerprinting.
pub fn normalize_text(text: &str) -> String {
    let stripped = url_regex().replace_all(text, |caps: &regex::Captures| strip_trackers(&caps[0]));
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compute the canonical hash of a message text.
pub fn canonical_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    format!("{:x}", hasher.finalize())
}
