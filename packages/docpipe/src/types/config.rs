//! Configuration types for crawling, model selection, and runs.
//!
//! Configuration is loaded once at the binary edge and passed in as
//! plain immutable values; the library never reads the environment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Default system instruction for the extraction stage.
pub const DEFAULT_EXTRACTION_INSTRUCTION: &str = "You are a technical documentation extractor. \
Convert the provided page content into clean Markdown sections describing the API \
documentation on the page. Preserve technical detail, parameter tables, and code blocks \
verbatim. Separate sections with blank lines. Omit navigation, cookie banners, and \
boilerplate.";

/// Configuration for the crawl stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Maximum crawl depth; the seed is depth 0
    pub max_depth: usize,

    /// Maximum number of pages to yield
    pub max_pages: usize,

    /// Follow links whose registered domain differs from the seed
    pub include_external: bool,

    /// Keywords that raise a link's crawl priority
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Weight of keyword matches in link scoring, in [0, 1].
    ///
    /// The remaining weight goes to the structural (depth) score.
    pub keyword_weight: f32,

    /// Delay between page fetches in milliseconds
    pub rate_limit_ms: u64,

    /// User-Agent header sent with every fetch
    pub user_agent: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_pages: 25,
            include_external: false,
            keywords: vec![],
            keyword_weight: 0.6,
            rate_limit_ms: 100,
            user_agent: "docpipe/0.1".to_string(),
        }
    }
}

impl CrawlConfig {
    /// Create a config with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum depth.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Set maximum pages.
    pub fn with_max_pages(mut self, max: usize) -> Self {
        self.max_pages = max;
        self
    }

    /// Follow external domains.
    pub fn with_external(mut self) -> Self {
        self.include_external = true;
        self
    }

    /// Set priority keywords.
    pub fn with_keywords(mut self, keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.keywords = keywords.into_iter().map(|k| k.into()).collect();
        self
    }

    /// Set the keyword weight.
    pub fn with_keyword_weight(mut self, weight: f32) -> Self {
        self.keyword_weight = weight;
        self
    }

    /// Set the politeness delay.
    pub fn with_rate_limit_ms(mut self, ms: u64) -> Self {
        self.rate_limit_ms = ms;
        self
    }

    /// Check limit and weight ranges.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_depth < 1 {
            return Err(PipelineError::Config("max_depth must be >= 1".into()));
        }
        if self.max_pages < 1 {
            return Err(PipelineError::Config("max_pages must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.keyword_weight) {
            return Err(PipelineError::Config(
                "keyword_weight must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Model configuration for the extraction stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorModelConfig {
    /// Opaque provider identifier (e.g. "openai/gpt-4o")
    pub provider: String,

    /// Sampling temperature; low for deterministic extraction
    pub temperature: f32,

    /// System instruction sent with every extraction call
    pub instruction: String,
}

impl Default for ExtractorModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai/gpt-4o".to_string(),
            temperature: 0.1,
            instruction: DEFAULT_EXTRACTION_INSTRUCTION.to_string(),
        }
    }
}

impl ExtractorModelConfig {
    /// Create a config for a provider with default temperature and
    /// instruction.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    /// Override the extraction instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Model configuration for the relevance filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterModelConfig {
    /// Opaque provider identifier
    pub provider: String,

    /// Sampling temperature; 0 for reproducible decisions
    pub temperature: f32,
}

impl Default for FilterModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai/gpt-4o-mini".to_string(),
            temperature: 0.0,
        }
    }
}

impl FilterModelConfig {
    /// Create a config for a provider with temperature 0.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Seed URL the crawl starts from
    pub seed_url: String,

    /// Directory the per-page Markdown and summary are written to
    pub output_dir: PathBuf,

    /// Topic the relevance filter judges pages against
    pub target_topic: Option<String>,

    /// Whether the relevance filter runs at all
    pub filtering_enabled: bool,
}

impl RunOptions {
    /// Create options for a seed URL with the default output directory.
    pub fn new(seed_url: impl Into<String>) -> Self {
        Self {
            seed_url: seed_url.into(),
            output_dir: PathBuf::from("output"),
            target_topic: None,
            filtering_enabled: false,
        }
    }

    /// Set the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Enable filtering against a target topic.
    pub fn with_filtering(mut self, topic: impl Into<String>) -> Self {
        self.target_topic = Some(topic.into());
        self.filtering_enabled = true;
        self
    }

    /// The filter topic, when filtering is effective.
    pub fn effective_topic(&self) -> Option<&str> {
        if !self.filtering_enabled {
            return None;
        }
        self.target_topic.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Enforce the `filtering_enabled => target_topic` invariant.
    ///
    /// Runs before any fetch; violation is fatal for the invocation.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.seed_url.trim().is_empty() {
            return Err(PipelineError::Config("seed URL must not be empty".into()));
        }
        if self.filtering_enabled && self.effective_topic().is_none() {
            return Err(PipelineError::Config(
                "--enable-filtering requires a non-empty --target-topic".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crawl_config_validate() {
        assert!(CrawlConfig::default().validate().is_ok());
        assert!(CrawlConfig::default().with_max_depth(0).validate().is_err());
        assert!(CrawlConfig::default().with_max_pages(0).validate().is_err());
        assert!(CrawlConfig::default()
            .with_keyword_weight(1.5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_filtering_requires_topic() {
        let mut options = RunOptions::new("https://example.test/docs");
        options.filtering_enabled = true;
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("--target-topic"));

        options.target_topic = Some("   ".to_string());
        assert!(options.validate().is_err());

        options.target_topic = Some("Python SDK documentation".to_string());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_topic_ignored_without_filtering() {
        let options = RunOptions::new("https://example.test/docs");
        assert!(options.validate().is_ok());
        assert_eq!(options.effective_topic(), None);

        let mut with_topic = options;
        with_topic.target_topic = Some("anything".to_string());
        assert_eq!(with_topic.effective_topic(), None);
    }
}
