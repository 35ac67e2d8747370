//! LM-backed relevance filter.
//!
//! One LM call per page decides include/exclude against a target
//! topic. The decision contract is strict JSON; anything else is a
//! parse failure. Parse failures and exhausted retries default to
//! INCLUDE (fail-open): extracting an irrelevant page is cheaper than
//! a false exclusion. The fallback is logged loudly and the failure
//! recorded verbatim in the decision explanation, but the default is
//! never silently flipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{LmError, LmResult};
use crate::lm::{strip_code_blocks, truncate_to_char_boundary, LanguageModel, LmRequest};
use crate::retry::{with_backoff, RetryPolicy};
use crate::types::config::FilterModelConfig;
use crate::types::page::CrawledPage;

/// Deterministic prefix of cleaned content sent to the judge.
const CONTENT_SAMPLE_BYTES: usize = 1500;

const FILTER_MAX_TOKENS: u32 = 256;

/// Verdict for one page.
#[derive(Debug, Clone)]
pub struct FilterDecision {
    /// True to keep the page
    pub included: bool,

    /// One short sentence from the judge, or the failure description
    /// when the fail-open default applied
    pub explanation: String,
}

/// Binary include/exclude judge over a target topic.
pub struct RelevanceFilter {
    lm: Arc<dyn LanguageModel>,
    config: FilterModelConfig,
    topic: String,
    calls: AtomicU64,
}

#[derive(Deserialize)]
struct RawDecision {
    decision: String,
    #[serde(default)]
    explanation: String,
}

impl RelevanceFilter {
    /// Create a filter judging pages against `topic`.
    pub fn new(
        lm: Arc<dyn LanguageModel>,
        config: FilterModelConfig,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            lm,
            config,
            topic: topic.into(),
            calls: AtomicU64::new(0),
        }
    }

    /// LM calls issued so far, retries included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Decide one page, retrying per `policy` and failing open.
    pub async fn evaluate(
        &self,
        page: &CrawledPage,
        policy: &RetryPolicy,
        lm_timeout: Duration,
    ) -> FilterDecision {
        let result = with_backoff(policy, "filter", || async move {
            match tokio::time::timeout(lm_timeout, self.judge_once(page)).await {
                Ok(result) => result,
                Err(_) => Err(LmError::Timeout),
            }
        })
        .await;

        match result {
            Ok(decision) => {
                debug!(
                    url = %page.url,
                    included = decision.included,
                    "filter decision"
                );
                decision
            }
            Err(e) => {
                warn!(url = %page.url, error = %e, "filter failed, defaulting to include");
                FilterDecision {
                    included: true,
                    explanation: format!("included by default after LM failure: {e}"),
                }
            }
        }
    }

    async fn judge_once(&self, page: &CrawledPage) -> LmResult<FilterDecision> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let system = format!(
            "You are a relevance judge for a documentation crawler. Decide whether a page \
             is relevant to the target topic: {topic}. Reply with exactly one JSON object: \
             {{\"decision\": \"include\" or \"exclude\", \"explanation\": \
             \"one short sentence\"}}.",
            topic = self.topic
        );
        let sample = truncate_to_char_boundary(&page.cleaned_html, CONTENT_SAMPLE_BYTES);
        let user = format!(
            "URL: {url}\nTitle: {title}\n\nContent sample:\n{sample}",
            url = page.url,
            title = page.title,
        );

        let request = LmRequest::chat(
            &self.config.provider,
            system,
            user,
            self.config.temperature,
            Some(FILTER_MAX_TOKENS),
        );
        let response = self.lm.complete(request).await?;
        parse_decision(&response.content)
    }
}

/// Parse the judge's reply: the first JSON object in the response,
/// with `decision` exactly "include" or "exclude".
fn parse_decision(raw: &str) -> LmResult<FilterDecision> {
    let stripped = strip_code_blocks(raw);
    let object = first_json_object(stripped)
        .ok_or_else(|| LmError::Parse(format!("no JSON object in response: {raw:?}")))?;

    let parsed: RawDecision = serde_json::from_str(object)
        .map_err(|e| LmError::Parse(format!("{e}; response: {raw:?}")))?;

    let included = match parsed.decision.as_str() {
        "include" => true,
        "exclude" => false,
        other => {
            return Err(LmError::Parse(format!(
                "decision must be \"include\" or \"exclude\", got {other:?}; response: {raw:?}"
            )))
        }
    };

    Ok(FilterDecision {
        included,
        explanation: parsed.explanation,
    })
}

/// Slice out the first balanced `{...}` object, skipping braces inside
/// JSON strings.
fn first_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLm;

    fn page() -> CrawledPage {
        CrawledPage::new("https://example.test/sdk", "# Python SDK\n\nInstall it.")
            .with_title("Python SDK")
    }

    #[test]
    fn test_parse_decision_include_exclude() {
        let inc = parse_decision(r#"{"decision": "include", "explanation": "SDK docs"}"#).unwrap();
        assert!(inc.included);
        assert_eq!(inc.explanation, "SDK docs");

        let exc = parse_decision(r#"{"decision": "exclude", "explanation": "blog post"}"#).unwrap();
        assert!(!exc.included);
    }

    #[test]
    fn test_parse_decision_tolerates_fences_and_prose() {
        let fenced = "```json\n{\"decision\": \"include\", \"explanation\": \"ok\"}\n```";
        assert!(parse_decision(fenced).unwrap().included);

        let prose = "Sure! Here is my verdict: {\"decision\": \"exclude\", \"explanation\": \"n/a\"} hope that helps";
        assert!(!parse_decision(prose).unwrap().included);
    }

    #[test]
    fn test_parse_decision_rejects_other_words() {
        let err = parse_decision(r#"{"decision": "maybe", "explanation": ""}"#).unwrap_err();
        assert!(matches!(err, LmError::Parse(_)));
        assert!(err.to_string().contains("maybe"));

        assert!(parse_decision("maybe").is_err());
    }

    #[test]
    fn test_first_json_object_handles_nesting_and_strings() {
        let s = r#"noise {"a": {"b": "}"}, "c": 1} trailing"#;
        assert_eq!(first_json_object(s), Some(r#"{"a": {"b": "}"}, "c": 1}"#));
        assert_eq!(first_json_object("no braces"), None);
    }

    #[tokio::test]
    async fn test_evaluate_fail_open_records_raw_response() {
        let lm = Arc::new(MockLm::new().with_response("Content sample", "maybe"));
        let filter = RelevanceFilter::new(lm, FilterModelConfig::default(), "Python SDK");

        let decision = filter
            .evaluate(&page(), &RetryPolicy::none(), Duration::from_secs(5))
            .await;

        assert!(decision.included);
        assert!(decision.explanation.contains("parse error"));
        assert!(decision.explanation.contains("maybe"));
        assert_eq!(filter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_evaluate_counts_retries() {
        let lm = Arc::new(MockLm::new().with_responses(
            "Content sample",
            vec![
                Err(LmError::Api("500".into())),
                Ok(r#"{"decision": "exclude", "explanation": "irrelevant"}"#.to_string()),
            ],
        ));
        let filter = RelevanceFilter::new(lm, FilterModelConfig::default(), "Python SDK");

        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let decision = filter
            .evaluate(&page(), &policy, Duration::from_secs(5))
            .await;

        assert!(!decision.included);
        assert_eq!(filter.call_count(), 2);
    }
}
