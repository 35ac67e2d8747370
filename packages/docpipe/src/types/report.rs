//! Run reporting types - per-page outcomes and the run summary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lm::LmUsage;

/// Terminal state of one page in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Filter decided exclude; no extraction, nothing persisted
    Excluded,

    /// Served from the cache without any LM call
    CacheHit,

    /// Extracted by the LM and persisted
    Extracted,

    /// Extraction or persistence failed after retries
    Failed,

    /// Never processed because the run was cancelled
    Cancelled,
}

/// Outcome record for one page, preserved in fetch order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageReport {
    /// Canonical page URL
    pub url: String,

    /// Page title, possibly empty
    pub title: String,

    /// Crawl depth
    pub depth: usize,

    /// Filter verdict (true when no filter ran)
    pub included: bool,

    /// Filter explanation; empty when no filter ran
    #[serde(default)]
    pub decision_explanation: String,

    /// Terminal state
    pub status: PageStatus,

    /// When the page was crawled
    pub crawl_timestamp: DateTime<Utc>,

    /// When the served extraction was produced (fresh or cached)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<DateTime<Utc>>,

    /// Output file the page was written to, when persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,

    /// Error description for failed pages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated LM usage for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Prompt tokens across all calls
    pub prompt_tokens: u64,

    /// Completion tokens across all calls
    pub completion_tokens: u64,

    /// Total tokens across all calls
    pub total_tokens: u64,

    /// Number of LM calls issued
    pub call_count: u64,
}

impl UsageTotals {
    /// Fold one response's usage into the totals.
    pub fn record(&mut self, usage: &LmUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
        self.call_count += 1;
    }
}

/// Summary emitted when a run completes.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Pages the fetcher yielded
    pub pages_fetched: usize,

    /// Page-level fetch failures the backend dropped
    pub failed_fetches: usize,

    /// Pages the filter included (equals `pages_fetched` when disabled)
    pub filtered_in: usize,

    /// Pages the filter excluded
    pub filtered_out: usize,

    /// Pages served from the cache
    pub cache_hits: usize,

    /// Pages that required extraction
    pub cache_misses: usize,

    /// Successful extractions
    pub extracted: usize,

    /// Pages that failed after retries
    pub failed: usize,

    /// Pages skipped because the run was cancelled
    pub cancelled: usize,

    /// Relevance-filter LM calls issued (including retries)
    pub filter_calls: u64,

    /// Extractor LM usage
    pub extractor_usage: UsageTotals,

    /// Wall-clock duration of the run
    pub duration: Duration,

    /// Per-page outcomes in fetch order
    pub pages: Vec<PageReport>,
}

impl RunSummary {
    /// True when no page failed and the run was not cancelled.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    /// One-line human rendering for logs and stdout.
    pub fn render(&self) -> String {
        format!(
            "fetched {} (dropped {}), filtered in/out {}/{}, cache hits/misses {}/{}, \
             extracted {}, failed {}, cancelled {}, filter calls {}, \
             extractor tokens {} over {} calls, in {:.1}s",
            self.pages_fetched,
            self.failed_fetches,
            self.filtered_in,
            self.filtered_out,
            self.cache_hits,
            self.cache_misses,
            self.extracted,
            self.failed,
            self.cancelled,
            self.filter_calls,
            self.extractor_usage.total_tokens,
            self.extractor_usage.call_count,
            self.duration.as_secs_f64(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_totals_record() {
        let mut totals = UsageTotals::default();
        totals.record(&LmUsage {
            prompt_tokens: 100,
            completion_tokens: 40,
            total_tokens: 140,
        });
        totals.record(&LmUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });

        assert_eq!(totals.prompt_tokens, 110);
        assert_eq!(totals.completion_tokens, 45);
        assert_eq!(totals.total_tokens, 155);
        assert_eq!(totals.call_count, 2);
    }

    #[test]
    fn test_page_status_serializes_snake_case() {
        let json = serde_json::to_string(&PageStatus::CacheHit).unwrap();
        assert_eq!(json, "\"cache_hit\"");
    }
}
