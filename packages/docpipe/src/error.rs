//! Typed errors for the docpipe library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can
//! match on failure kinds and the pipeline can convert each into a
//! tagged per-page outcome instead of a stack trace.

use thiserror::Error;

/// Errors that can abort a pipeline run or fail a single page.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid or missing configuration; fatal before any fetch
    #[error("config error: {0}")]
    Config(String),

    /// Crawl operation failed
    #[error("crawl failed: {0}")]
    Crawl(#[from] CrawlError),

    /// Language-model call failed
    #[error("LM error: {0}")]
    Lm(#[from] LmError),

    /// Content cache failure
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Writing the output directory failed
    #[error("output error: {0}")]
    Output(#[source] std::io::Error),
}

/// Errors raised by fetch backends.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Seed or discovered URL could not be parsed
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Connection timeout
    #[error("timeout crawling: {url}")]
    Timeout { url: String },
}

/// Errors raised by language-model calls.
///
/// Network, API, and parse failures are all retried by the pipeline;
/// after exhaustion the filter fails open and the extractor fails the
/// page. Clone lets mocks script repeated failures.
#[derive(Debug, Clone, Error)]
pub enum LmError {
    /// Connection-level failure (DNS, refused, reset)
    #[error("network error: {0}")]
    Network(String),

    /// Provider returned a non-2xx status or an empty response
    #[error("API error: {0}")]
    Api(String),

    /// Response did not match the component's schema
    #[error("parse error: {0}")]
    Parse(String),

    /// Per-call deadline expired
    #[error("LM call timed out")]
    Timeout,
}

/// Errors raised by the content cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or index file failed to (de)serialize
    #[error("cache JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `get_cached` was called for a URL with no usable record
    #[error("not cached: {url}")]
    NotCached { url: String },

    /// Index file was malformed; recovery rebuilds from page files
    #[error("cache index corrupt: {0}")]
    Corrupt(String),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for crawl operations.
pub type CrawlResult<T> = std::result::Result<T, CrawlError>;

/// Result type alias for language-model calls.
pub type LmResult<T> = std::result::Result<T, LmError>;

/// Result type alias for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
