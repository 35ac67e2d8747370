//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use docpipe without
//! making real LM or network calls.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{CrawlResult, LmError, LmResult};
use crate::fetch::{Crawled, Fetcher};
use crate::lm::{LanguageModel, LmRequest, LmResponse, LmUsage};
use crate::types::config::CrawlConfig;
use crate::types::page::CrawledPage;

/// A mock language model with scripted, matcher-based responses.
///
/// Each script pairs a substring matcher (tested against the request's
/// concatenated message contents) with a queue of results. Queues are
/// consumed front to back; the final entry is sticky so retries keep
/// observing it. Requests matching no script get a deterministic
/// default response.
#[derive(Default)]
pub struct MockLm {
    scripts: Mutex<Vec<Script>>,
    calls: Mutex<Vec<LmRequest>>,
}

struct Script {
    matcher: String,
    responses: VecDeque<LmResult<String>>,
}

impl MockLm {
    /// Create a mock with no scripts (default responses only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `content` for requests containing `matcher`.
    pub fn with_response(self, matcher: impl Into<String>, content: impl Into<String>) -> Self {
        self.with_responses(matcher, vec![Ok(content.into())])
    }

    /// Always fail with `error` for requests containing `matcher`.
    pub fn with_error(self, matcher: impl Into<String>, error: LmError) -> Self {
        self.with_responses(matcher, vec![Err(error)])
    }

    /// Script a sequence of results for requests containing `matcher`.
    pub fn with_responses(
        self,
        matcher: impl Into<String>,
        responses: Vec<LmResult<String>>,
    ) -> Self {
        self.scripts.lock().unwrap().push(Script {
            matcher: matcher.into(),
            responses: responses.into_iter().collect(),
        });
        self
    }

    /// All requests made so far.
    pub fn calls(&self) -> Vec<LmRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of completion calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn scripted(&self, content: &str) -> Option<LmResult<String>> {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .iter_mut()
            .find(|s| content.contains(&s.matcher))?;
        if script.responses.len() > 1 {
            script.responses.pop_front()
        } else {
            script.responses.front().cloned()
        }
    }
}

#[async_trait]
impl LanguageModel for MockLm {
    async fn complete(&self, request: LmRequest) -> LmResult<LmResponse> {
        let joined = request.joined_content();
        self.calls.lock().unwrap().push(request);

        let content = match self.scripted(&joined) {
            Some(result) => result?,
            None => "Mock overview section.\n\nMock detail section.".to_string(),
        };

        Ok(LmResponse {
            content,
            usage: LmUsage {
                prompt_tokens: 120,
                completion_tokens: 40,
                total_tokens: 160,
            },
        })
    }
}

/// A mock fetcher yielding canned pages.
#[derive(Default)]
pub struct MockFetcher {
    pages: Vec<CrawledPage>,
    failed_fetches: usize,
}

impl MockFetcher {
    /// Create an empty mock fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a page to the canned yield sequence.
    pub fn with_page(mut self, page: CrawledPage) -> Self {
        self.pages.push(page);
        self
    }

    /// Report this many page-level fetch failures.
    pub fn with_failed_fetches(mut self, count: usize) -> Self {
        self.failed_fetches = count;
        self
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn crawl(&self, _seed_url: &str, config: &CrawlConfig) -> CrawlResult<Crawled> {
        let mut pages = self.pages.clone();
        pages.truncate(config.max_pages);
        Ok(Crawled {
            pages,
            failed_fetches: self.failed_fetches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lm_scripts_and_default() {
        let lm = MockLm::new()
            .with_response("alpha", "scripted")
            .with_responses(
                "beta",
                vec![Err(LmError::Api("500".into())), Ok("recovered".to_string())],
            );

        let req = |text: &str| LmRequest::chat("openai/gpt-4o", "sys", text, 0.0, None);

        let scripted = lm.complete(req("has alpha inside")).await.unwrap();
        assert_eq!(scripted.content, "scripted");

        assert!(lm.complete(req("beta call")).await.is_err());
        assert_eq!(lm.complete(req("beta call")).await.unwrap().content, "recovered");
        // Last response is sticky.
        assert_eq!(lm.complete(req("beta call")).await.unwrap().content, "recovered");

        let fallback = lm.complete(req("unmatched")).await.unwrap();
        assert!(fallback.content.contains("Mock overview"));
        assert_eq!(lm.call_count(), 5);
    }

    #[tokio::test]
    async fn test_mock_fetcher_honors_max_pages() {
        let fetcher = MockFetcher::new()
            .with_page(CrawledPage::new("https://example.test/a", "A"))
            .with_page(CrawledPage::new("https://example.test/b", "B"))
            .with_page(CrawledPage::new("https://example.test/c", "C"));

        let config = CrawlConfig::default().with_max_pages(2);
        let crawled = fetcher.crawl("https://example.test/", &config).await.unwrap();
        assert_eq!(crawled.pages.len(), 2);
    }
}
