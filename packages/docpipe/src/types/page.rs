//! Page types - crawled pages and the records persisted for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Calculate the lowercase-hex SHA-256 of cleaned page content.
///
/// This is the cache key for change detection. The hash is always
/// computed over the cleaner's output, never raw HTML.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A page produced by the fetch backend.
///
/// `cleaned_html` is the cleaner's Markdown-ish rendering with
/// navigation chrome removed; downstream stages never see raw HTML.
#[derive(Debug, Clone)]
pub struct CrawledPage {
    /// Canonical absolute URL
    pub url: String,

    /// Page title, empty when the page had none
    pub title: String,

    /// Cleaned textual rendering of the page
    pub cleaned_html: String,

    /// Crawl depth; the seed is 0
    pub depth: usize,

    /// When the page was fetched
    pub fetched_at: DateTime<Utc>,
}

impl CrawledPage {
    /// Create a new crawled page at depth 0.
    pub fn new(url: impl Into<String>, cleaned_html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: String::new(),
            cleaned_html: cleaned_html.into(),
            depth: 0,
            fetched_at: Utc::now(),
        }
    }

    /// Set the page title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the crawl depth.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Content hash of the cleaned rendering.
    pub fn content_hash(&self) -> String {
        hash_content(&self.cleaned_html)
    }
}

/// Structured sections extracted from one page.
///
/// `content` is always a non-empty sequence of non-empty strings;
/// pages the extractor cannot parse surface as errors, never as empty
/// payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionPayload {
    /// URL the sections were extracted from
    pub url: String,

    /// Ordered extracted sections
    pub content: Vec<String>,

    /// When the extraction LM call succeeded
    pub extraction_timestamp: DateTime<Utc>,
}

impl ExtractionPayload {
    /// Create a payload stamped with the current time.
    pub fn new(url: impl Into<String>, content: Vec<String>) -> Self {
        Self {
            url: url.into(),
            content,
            extraction_timestamp: Utc::now(),
        }
    }
}

/// Crawl/decision metadata persisted alongside every extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMetadata {
    /// URL of the page
    pub url: String,

    /// Page title, possibly empty
    pub title: String,

    /// Crawl depth
    pub depth: usize,

    /// True when the filter was absent/disabled or decided include
    pub included: bool,

    /// Filter explanation; empty when no filter ran
    #[serde(default)]
    pub decision_explanation: String,

    /// Hash of the cleaned content this record was extracted from.
    ///
    /// Lets a corrupt index be rebuilt from the per-page files.
    pub content_hash: String,

    /// When the page was crawled
    pub crawl_timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_content_is_sha256_hex() {
        let hash = hash_content("Hello, world!");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash.to_lowercase());
        // Stable across calls
        assert_eq!(hash, hash_content("Hello, world!"));
        assert_ne!(hash, hash_content("Hello, universe!"));
    }

    #[test]
    fn test_crawled_page_builder() {
        let page = CrawledPage::new("https://example.test/docs", "# Docs")
            .with_title("Docs")
            .with_depth(1);

        assert_eq!(page.title, "Docs");
        assert_eq!(page.depth, 1);
        assert_eq!(page.content_hash(), hash_content("# Docs"));
    }

    #[test]
    fn test_extraction_payload_roundtrip() {
        let payload = ExtractionPayload::new(
            "https://example.test/docs",
            vec!["## Install".to_string(), "Run `cargo add`.".to_string()],
        );

        let json = serde_json::to_string(&payload).unwrap();
        let back: ExtractionPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.url, payload.url);
        assert_eq!(back.content, payload.content);
    }
}
