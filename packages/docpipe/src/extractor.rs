//! LM-backed structured extraction.
//!
//! One LM call per page converts the cleaned rendering into an ordered
//! sequence of Markdown sections. The response splitter is the
//! canonical one: blank-line-separated non-empty chunks. An empty
//! section list is a parse error, never an empty payload.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::{LmError, LmResult};
use crate::lm::{strip_code_blocks, LanguageModel, LmRequest};
use crate::retry::{with_backoff, RetryPolicy};
use crate::types::config::ExtractorModelConfig;
use crate::types::page::CrawledPage;
use crate::types::report::UsageTotals;

const EXTRACT_MAX_TOKENS: u32 = 4096;

/// Converts cleaned pages into extracted sections, tallying usage.
pub struct Extractor {
    lm: Arc<dyn LanguageModel>,
    config: ExtractorModelConfig,
    usage: Mutex<UsageTotals>,
}

impl Extractor {
    /// Create an extractor for one run.
    pub fn new(lm: Arc<dyn LanguageModel>, config: ExtractorModelConfig) -> Self {
        Self {
            lm,
            config,
            usage: Mutex::new(UsageTotals::default()),
        }
    }

    /// Usage aggregated across the run so far.
    pub fn usage(&self) -> UsageTotals {
        *self.usage.lock().unwrap()
    }

    /// Extract one page, retrying per `policy`.
    ///
    /// Retries never alter the temperature or any other request knob.
    pub async fn extract(
        &self,
        page: &CrawledPage,
        policy: &RetryPolicy,
        lm_timeout: Duration,
    ) -> LmResult<Vec<String>> {
        with_backoff(policy, "extract", || async move {
            match tokio::time::timeout(lm_timeout, self.extract_once(page)).await {
                Ok(result) => result,
                Err(_) => Err(LmError::Timeout),
            }
        })
        .await
    }

    async fn extract_once(&self, page: &CrawledPage) -> LmResult<Vec<String>> {
        let user = format!(
            "Source URL: {url}\nPage title: {title}\n\nPage content:\n{content}",
            url = page.url,
            title = page.title,
            content = page.cleaned_html,
        );

        let request = LmRequest::chat(
            &self.config.provider,
            &self.config.instruction,
            user,
            self.config.temperature,
            Some(EXTRACT_MAX_TOKENS),
        );
        let response = self.lm.complete(request).await?;
        self.usage.lock().unwrap().record(&response.usage);

        let sections = split_sections(&response.content);
        if sections.is_empty() {
            return Err(LmError::Parse(format!(
                "no sections in extraction response: {:?}",
                response.content
            )));
        }

        debug!(
            url = %page.url,
            sections = sections.len(),
            "extraction complete"
        );
        Ok(sections)
    }
}

/// Canonical splitter: trim an outer code fence, then split on blank
/// lines into non-empty chunks.
pub fn split_sections(text: &str) -> Vec<String> {
    strip_code_blocks(text)
        .split("\n\n")
        .map(|chunk| chunk.trim())
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| chunk.to_string())
        .collect()
}
