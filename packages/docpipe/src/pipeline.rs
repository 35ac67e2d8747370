//! Pipeline orchestrator.
//!
//! Composes fetch → filter → cache-decide → extract → cache-put →
//! output, enforcing the per-page state machine:
//!
//! ```text
//! FETCHED → (DECIDED_INCLUDE | DECIDED_EXCLUDE | FILTER_SKIPPED)
//!         → (CACHE_HIT | CACHE_MISS)
//!         → (EXTRACTED | EXTRACTION_FAILED)
//!         → PERSISTED | FAILED
//! ```
//!
//! The fetch completes in full before filtering begins. Filter and
//! extraction run in separate bounded pools; ordered buffering makes
//! the gather step the stream order itself, so results always come
//! back in the fetcher's yield order. Within one page, filter →
//! cache-decide → extract is strictly sequential.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CacheDecision, ContentCache, DEFAULT_CACHE_DIR};
use crate::error::{PipelineError, Result};
use crate::extractor::Extractor;
use crate::fetch::Fetcher;
use crate::filter::RelevanceFilter;
use crate::lm::LanguageModel;
use crate::output;
use crate::retry::RetryPolicy;
use crate::types::config::{CrawlConfig, ExtractorModelConfig, FilterModelConfig, RunOptions};
use crate::types::page::{CrawledPage, ExtractionPayload, PageMetadata};
use crate::types::report::{PageReport, PageStatus, RunSummary};

/// Concurrency and deadline knobs.
#[derive(Debug, Clone)]
pub struct PipelineLimits {
    /// In-flight relevance-filter LM calls
    pub filter_concurrency: usize,

    /// In-flight extraction LM calls; lower because extraction prompts
    /// are larger and slower
    pub extract_concurrency: usize,

    /// Deadline for one LM call
    pub lm_timeout: Duration,

    /// Deadline for all of one page's LM and I/O work
    pub page_timeout: Duration,

    /// Grace given to in-flight work after cancellation
    pub drain_timeout: Duration,

    /// Backoff policy for LM calls
    pub retry: RetryPolicy,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            filter_concurrency: 8,
            extract_concurrency: 4,
            lm_timeout: Duration::from_secs(60),
            page_timeout: Duration::from_secs(180),
            drain_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Immutable configuration for a pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Crawl bounds and priorities
    pub crawl: CrawlConfig,

    /// Extraction model settings
    pub extractor: ExtractorModelConfig,

    /// Filter model settings; required only when filtering is enabled
    pub filter: Option<FilterModelConfig>,

    /// Cache root directory
    pub cache_dir: PathBuf,

    /// Concurrency and deadlines
    pub limits: PipelineLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            crawl: CrawlConfig::default(),
            extractor: ExtractorModelConfig::default(),
            filter: None,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            limits: PipelineLimits::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the crawl config.
    pub fn with_crawl(mut self, crawl: CrawlConfig) -> Self {
        self.crawl = crawl;
        self
    }

    /// Set the extractor model config.
    pub fn with_extractor(mut self, extractor: ExtractorModelConfig) -> Self {
        self.extractor = extractor;
        self
    }

    /// Set the filter model config.
    pub fn with_filter(mut self, filter: FilterModelConfig) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set the cache root.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set concurrency and deadline knobs.
    pub fn with_limits(mut self, limits: PipelineLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Relevance decision attached to a page before extraction.
enum Decision {
    /// No filter ran
    Unfiltered,

    /// Filter decided include
    Include { explanation: String },

    /// Filter decided exclude; terminal
    Exclude { explanation: String },

    /// Run was cancelled before the page was considered
    Skipped,
}

/// Terminal processing outcome for one page.
enum Outcome {
    Hit(ExtractionPayload),
    Extracted(ExtractionPayload),
    Failed(String),
    Cancelled,
}

struct ProcessedPage {
    report: PageReport,
    payload: Option<ExtractionPayload>,
}

/// End-to-end crawl/filter/extract/persist orchestrator.
///
/// Owns its [`ContentCache`] for the duration of each run; no global
/// state, no ambient configuration.
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    extractor_lm: Arc<dyn LanguageModel>,
    filter_lm: Option<Arc<dyn LanguageModel>>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a pipeline over a fetch backend and an extraction model.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        extractor_lm: Arc<dyn LanguageModel>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            extractor_lm,
            filter_lm: None,
            config,
        }
    }

    /// Attach the model used by the relevance filter.
    pub fn with_filter_lm(mut self, lm: Arc<dyn LanguageModel>) -> Self {
        self.filter_lm = Some(lm);
        self
    }

    /// Run to completion.
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        self.run_with_cancel(options, CancellationToken::new()).await
    }

    /// Run with a cancellation signal.
    ///
    /// On cancellation no new work is started, in-flight work gets
    /// `drain_timeout` to finish, and the partial result is returned.
    /// Cache entries persisted before the signal remain valid.
    pub async fn run_with_cancel(
        &self,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let start = Instant::now();

        // Validation happens before any fetch or LM call.
        options.validate()?;
        self.config.crawl.validate()?;
        let filter = self.build_filter(options)?;

        // Opening the cache now also catches an unwritable cache root
        // while the failure is still fatal rather than per-page.
        let cache = ContentCache::open(&self.config.cache_dir).await?;
        let removed = cache.reconcile().await?;
        if removed > 0 {
            warn!(removed, "dropped stale cache index entries");
        }
        let extractor = Extractor::new(self.extractor_lm.clone(), self.config.extractor.clone());

        info!(
            seed = %options.seed_url,
            filtering = filter.is_some(),
            "pipeline run starting"
        );

        let crawled = self
            .fetcher
            .crawl(&options.seed_url, &self.config.crawl)
            .await?;
        let pages_fetched = crawled.pages.len();
        let failed_fetches = crawled.failed_fetches;
        info!(pages = pages_fetched, dropped = failed_fetches, "fetch complete");

        // Stage 1: relevance decisions, bounded fan-out, input order
        // preserved.
        let decisions: Vec<Decision> = match &filter {
            Some(filter) => {
                stream::iter(crawled.pages.iter())
                    .map(|page| {
                        let cancel = cancel.clone();
                        async move {
                            if cancel.is_cancelled() {
                                return Decision::Skipped;
                            }
                            let decision = filter
                                .evaluate(
                                    page,
                                    &self.config.limits.retry,
                                    self.config.limits.lm_timeout,
                                )
                                .await;
                            if decision.included {
                                Decision::Include {
                                    explanation: decision.explanation,
                                }
                            } else {
                                Decision::Exclude {
                                    explanation: decision.explanation,
                                }
                            }
                        }
                    })
                    .buffered(self.config.limits.filter_concurrency)
                    .collect()
                    .await
            }
            None => crawled.pages.iter().map(|_| Decision::Unfiltered).collect(),
        };

        // Stage 2: cache decide + extraction, bounded fan-out, order
        // preserved for the gather.
        let mut results: Vec<ProcessedPage> = stream::iter(
            crawled.pages.into_iter().zip(decisions),
        )
        .map(|(page, decision)| self.process_page(page, decision, &cache, &extractor, &cancel))
        .buffered(self.config.limits.extract_concurrency)
        .collect()
        .await;

        // Persist outputs for every served page (fresh or cached).
        for processed in &mut results {
            if let Some(payload) = &processed.payload {
                let filename = output::write_page(&options.output_dir, &processed.report, payload)
                    .await
                    .map_err(PipelineError::Output)?;
                processed.report.output_file = Some(filename);
            }
        }
        let reports: Vec<PageReport> = results.into_iter().map(|p| p.report).collect();
        output::write_summary(&options.output_dir, &reports)
            .await
            .map_err(PipelineError::Output)?;

        let summary = self.summarize(
            reports,
            pages_fetched,
            failed_fetches,
            filter.as_ref(),
            &extractor,
            start.elapsed(),
        );
        info!(summary = %summary.render(), "pipeline run finished");
        Ok(summary)
    }

    fn build_filter(&self, options: &RunOptions) -> Result<Option<RelevanceFilter>> {
        let Some(topic) = options.effective_topic() else {
            return Ok(None);
        };
        let lm = self.filter_lm.clone().ok_or_else(|| {
            PipelineError::Config("filtering enabled but no filter model attached".into())
        })?;
        let config = self.config.filter.clone().ok_or_else(|| {
            PipelineError::Config("filtering enabled but no filter model configured".into())
        })?;
        Ok(Some(RelevanceFilter::new(lm, config, topic)))
    }

    async fn process_page(
        &self,
        page: CrawledPage,
        decision: Decision,
        cache: &ContentCache,
        extractor: &Extractor,
        cancel: &CancellationToken,
    ) -> ProcessedPage {
        let (included, explanation) = match decision {
            Decision::Skipped => {
                return ProcessedPage {
                    report: page_report(&page, false, String::new(), PageStatus::Cancelled, None),
                    payload: None,
                }
            }
            Decision::Exclude { explanation } => {
                return ProcessedPage {
                    report: page_report(&page, false, explanation, PageStatus::Excluded, None),
                    payload: None,
                }
            }
            Decision::Include { explanation } => (true, explanation),
            Decision::Unfiltered => (true, String::new()),
        };

        if cancel.is_cancelled() {
            return ProcessedPage {
                report: page_report(&page, included, explanation, PageStatus::Cancelled, None),
                payload: None,
            };
        }

        let work = self.decide_and_extract(&page, included, &explanation, cache, extractor);
        let outcome = tokio::select! {
            result = tokio::time::timeout(self.config.limits.page_timeout, work) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Outcome::Failed("page deadline exceeded".to_string()),
                }
            }
            _ = cancelled_and_drained(cancel, self.config.limits.drain_timeout) => {
                Outcome::Cancelled
            }
        };

        match outcome {
            Outcome::Hit(payload) => ProcessedPage {
                report: page_report(
                    &page,
                    included,
                    explanation,
                    PageStatus::CacheHit,
                    Some(payload.extraction_timestamp),
                ),
                payload: Some(payload),
            },
            Outcome::Extracted(payload) => ProcessedPage {
                report: page_report(
                    &page,
                    included,
                    explanation,
                    PageStatus::Extracted,
                    Some(payload.extraction_timestamp),
                ),
                payload: Some(payload),
            },
            Outcome::Failed(error) => {
                let mut report =
                    page_report(&page, included, explanation, PageStatus::Failed, None);
                report.error = Some(error);
                ProcessedPage {
                    report,
                    payload: None,
                }
            }
            Outcome::Cancelled => ProcessedPage {
                report: page_report(&page, included, explanation, PageStatus::Cancelled, None),
                payload: None,
            },
        }
    }

    /// Cache check immediately before the extraction decision, using
    /// the cleaned content the fetcher produced.
    async fn decide_and_extract(
        &self,
        page: &CrawledPage,
        included: bool,
        explanation: &str,
        cache: &ContentCache,
        extractor: &Extractor,
    ) -> Outcome {
        match cache.decide(&page.url, &page.cleaned_html) {
            CacheDecision::Hit => match cache.get_cached(&page.url).await {
                Ok((payload, _metadata)) => Outcome::Hit(payload),
                Err(e) => {
                    // Index said hit but the files are unreadable;
                    // recover by extracting fresh.
                    warn!(url = %page.url, error = %e, "cache hit unreadable, re-extracting");
                    self.extract_and_store(page, included, explanation, cache, extractor)
                        .await
                }
            },
            CacheDecision::Miss(_) => {
                self.extract_and_store(page, included, explanation, cache, extractor)
                    .await
            }
        }
    }

    async fn extract_and_store(
        &self,
        page: &CrawledPage,
        included: bool,
        explanation: &str,
        cache: &ContentCache,
        extractor: &Extractor,
    ) -> Outcome {
        let sections = match extractor
            .extract(page, &self.config.limits.retry, self.config.limits.lm_timeout)
            .await
        {
            Ok(sections) => sections,
            // EXTRACTION_FAILED: no cache write.
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        let payload = ExtractionPayload::new(&page.url, sections);
        let metadata = PageMetadata {
            url: page.url.clone(),
            title: page.title.clone(),
            depth: page.depth,
            included,
            decision_explanation: explanation.to_string(),
            content_hash: page.content_hash(),
            crawl_timestamp: page.fetched_at,
        };

        match cache
            .put(&page.url, &metadata.content_hash, &payload, &metadata)
            .await
        {
            Ok(()) => Outcome::Extracted(payload),
            Err(e) => Outcome::Failed(format!("cache write failed: {e}")),
        }
    }

    fn summarize(
        &self,
        reports: Vec<PageReport>,
        pages_fetched: usize,
        failed_fetches: usize,
        filter: Option<&RelevanceFilter>,
        extractor: &Extractor,
        duration: Duration,
    ) -> RunSummary {
        let count = |status: PageStatus| reports.iter().filter(|r| r.status == status).count();

        let cache_hits = count(PageStatus::CacheHit);
        let extracted = count(PageStatus::Extracted);
        let failed = count(PageStatus::Failed);
        let filtered_out = count(PageStatus::Excluded);
        let cancelled = count(PageStatus::Cancelled);

        RunSummary {
            pages_fetched,
            failed_fetches,
            filtered_in: pages_fetched - filtered_out - cancelled,
            filtered_out,
            cache_hits,
            // Every page that reached the extractor.
            cache_misses: extracted + failed,
            extracted,
            failed,
            cancelled,
            filter_calls: filter.map(|f| f.call_count()).unwrap_or(0),
            extractor_usage: extractor.usage(),
            duration,
            pages: reports,
        }
    }
}

fn page_report(
    page: &CrawledPage,
    included: bool,
    decision_explanation: String,
    status: PageStatus,
    extracted_at: Option<chrono::DateTime<chrono::Utc>>,
) -> PageReport {
    PageReport {
        url: page.url.clone(),
        title: page.title.clone(),
        depth: page.depth,
        included,
        decision_explanation,
        status,
        crawl_timestamp: page.fetched_at,
        extracted_at,
        output_file: None,
        error: None,
    }
}

async fn cancelled_and_drained(cancel: &CancellationToken, drain: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(drain).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = PipelineLimits::default();
        assert_eq!(limits.filter_concurrency, 8);
        assert_eq!(limits.extract_concurrency, 4);
        assert_eq!(limits.lm_timeout, Duration::from_secs(60));
        assert_eq!(limits.page_timeout, Duration::from_secs(180));
        assert_eq!(limits.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_default_cache_dir() {
        let config = PipelineConfig::default();
        assert_eq!(config.cache_dir, PathBuf::from("extracted-docs"));
    }
}
