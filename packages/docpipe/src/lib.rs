//! # docpipe
//!
//! An LM-assisted documentation crawler and structured extractor.
//!
//! ## Architecture
//!
//! ```text
//! FETCH → FILTER → CACHE-DECIDE → EXTRACT → CACHE-PUT → PERSIST
//!
//! 1. Fetcher crawls from a seed URL, best-first, depth/count bounded
//! 2. RelevanceFilter (optional) keeps pages matching a target topic
//! 3. ContentCache answers unchanged pages without any LM call
//! 4. Extractor turns cleaned pages into ordered Markdown sections
//! 5. Results land in the cache and the output directory
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use docpipe::{HttpFetcher, OpenAiLm, Pipeline, PipelineConfig, RunOptions};
//!
//! let lm = Arc::new(OpenAiLm::from_env()?);
//! let pipeline = Pipeline::new(
//!     Arc::new(HttpFetcher::new()),
//!     lm.clone(),
//!     PipelineConfig::default(),
//! );
//!
//! let options = RunOptions::new("https://docs.example.com/");
//! let summary = pipeline.run(&options).await?;
//! println!("{}", summary.render());
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Data model (pages, configs, run reports)
//! - [`lm`] - Language-model contract and the OpenAI-compatible client
//! - [`cache`] - Content-addressed extraction cache
//! - [`fetch`] - Crawl contract and the bundled HTTP fetcher
//! - [`filter`] - LM relevance filter (fail-open on parse errors)
//! - [`extractor`] - LM section extraction with usage accounting
//! - [`pipeline`] - End-to-end orchestration
//! - [`testing`] - Mock implementations for tests

pub mod cache;
pub mod error;
pub mod extractor;
pub mod fetch;
pub mod filter;
pub mod lm;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod testing;
pub mod types;

// Re-export core types at crate root
pub use cache::{CacheDecision, CacheStats, ContentCache, MissReason};
pub use error::{CacheError, CrawlError, LmError, PipelineError, Result};
pub use extractor::Extractor;
pub use fetch::{Crawled, Fetcher, HttpFetcher};
pub use filter::{FilterDecision, RelevanceFilter};
pub use lm::{LanguageModel, LmMessage, LmRequest, LmResponse, LmUsage, OpenAiLm};
pub use pipeline::{Pipeline, PipelineConfig, PipelineLimits};
pub use retry::RetryPolicy;
pub use types::{
    config::{CrawlConfig, ExtractorModelConfig, FilterModelConfig, RunOptions},
    page::{hash_content, CrawledPage, ExtractionPayload, PageMetadata},
    report::{PageReport, PageStatus, RunSummary, UsageTotals},
};
