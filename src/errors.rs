//! Error deduplication for failed samples.
//!
//! Each label keeps an ordered list of distinct error entries; the registry
//! caps how many distinct messages the whole run may track so that a noisy
//! test cannot grow error state without bound.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// One deduplicated error: the exact message text plus the response codes
/// and sample URLs it was seen with. Identity is the message string within
/// a single label's list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub message: String,
    pub count: u64,
    pub response_codes: BTreeMap<String, u64>,
    pub urls: BTreeSet<String>,
}

impl ErrorEntry {
    pub fn new(message: impl Into<String>, response_code: &str, url: Option<&str>) -> Self {
        let mut response_codes = BTreeMap::new();
        response_codes.insert(response_code.to_string(), 1);
        let mut urls = BTreeSet::new();
        if let Some(url) = url {
            if !url.is_empty() {
                urls.insert(url.to_string());
            }
        }
        Self {
            message: message.into(),
            count: 1,
            response_codes,
            urls,
        }
    }
}

/// Merge `src` entries into `dst`, combining same-message entries by summing
/// counts and unioning codes/urls. The result never holds two entries with
/// the same message; entries are always fresh values, never shared.
pub fn merge_entries(dst: &mut Vec<ErrorEntry>, src: &[ErrorEntry]) {
    for entry in src {
        match dst.iter_mut().find(|e| e.message == entry.message) {
            Some(existing) => {
                existing.count += entry.count;
                for (code, count) in &entry.response_codes {
                    *existing.response_codes.entry(code.clone()).or_insert(0) += count;
                }
                existing
                    .urls
                    .extend(entry.urls.iter().cloned());
            }
            None => dst.push(entry.clone()),
        }
    }
}

/// Run-wide cap on distinct tracked error messages.
///
/// Messages past the cap are dropped entirely; counts of already-admitted
/// messages keep accumulating regardless.
#[derive(Debug, Clone)]
pub struct ErrorRegistry {
    known: HashSet<String>,
    cap: usize,
}

impl ErrorRegistry {
    pub fn new(cap: usize) -> Self {
        Self {
            known: HashSet::new(),
            cap,
        }
    }

    /// Decide whether `message` may be tracked. Known messages are always
    /// admitted; unknown ones only while the cap has room.
    pub fn admit(&mut self, message: &str) -> bool {
        if self.known.contains(message) {
            return true;
        }
        if self.known.len() >= self.cap {
            return false;
        }
        self.known.insert(message.to_string());
        true
    }

    /// Number of distinct messages admitted so far.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_caps_distinct_messages() {
        let mut registry = ErrorRegistry::new(2);
        assert!(registry.admit("timeout"));
        assert!(registry.admit("refused"));
        assert!(!registry.admit("reset"));
        // known messages keep being admitted past the cap
        assert!(registry.admit("timeout"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn merge_combines_same_message_entries() {
        let mut dst = vec![ErrorEntry::new("timeout", "504", Some("/checkout"))];
        let src = vec![
            ErrorEntry::new("timeout", "504", Some("/cart")),
            ErrorEntry::new("refused", "502", None),
        ];

        merge_entries(&mut dst, &src);
        assert_eq!(dst.len(), 2);
        assert_eq!(dst[0].count, 2);
        assert_eq!(dst[0].response_codes["504"], 2);
        assert_eq!(dst[0].urls.len(), 2);
        assert_eq!(dst[1].message, "refused");
        assert_eq!(dst[1].count, 1);
    }

    #[test]
    fn merge_never_duplicates_identity() {
        let mut dst: Vec<ErrorEntry> = Vec::new();
        let src = vec![ErrorEntry::new("boom", "500", None)];
        merge_entries(&mut dst, &src);
        merge_entries(&mut dst, &src);

        assert_eq!(dst.len(), 1);
        assert_eq!(dst[0].count, 2);
    }
}
