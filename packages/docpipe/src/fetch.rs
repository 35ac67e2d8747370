//! Fetch backend: the crawl contract and the bundled HTTP fetcher.
//!
//! The pipeline only depends on the [`Fetcher`] trait; [`HttpFetcher`]
//! is the bundled reqwest implementation. It runs a bounded best-first
//! crawl: discovered links are scored by a weighted sum of keyword
//! matches (in link text and URL) and a structural depth penalty, and
//! the highest-scoring frontier entry is fetched next. Ties break by
//! discovery order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{CrawlError, CrawlResult};
use crate::types::config::CrawlConfig;
use crate::types::page::CrawledPage;

/// Result of one crawl: the yielded pages plus the count of page-level
/// fetch failures the backend dropped.
#[derive(Debug, Clone, Default)]
pub struct Crawled {
    /// Pages in yield order; at most `max_pages`
    pub pages: Vec<CrawledPage>,

    /// Pages that failed to fetch and were dropped
    pub failed_fetches: usize,
}

/// Contract the pipeline requires from a fetch backend.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Produce a finite, deduplicated, depth- and count-bounded
    /// sequence of cleaned pages starting from `seed_url`.
    async fn crawl(&self, seed_url: &str, config: &CrawlConfig) -> CrawlResult<Crawled>;
}

/// Reqwest-based best-first crawler.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A frontier entry. Max-heap: higher score first, then earlier
/// discovery.
struct Candidate {
    score: f32,
    seq: u64,
    url: Url,
    depth: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl HttpFetcher {
    /// Create a fetcher with a 30-second request timeout.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
        }
    }

    /// Fetch one URL, returning the raw HTML and the final URL after
    /// redirects (links are resolved against the latter).
    async fn fetch_page(&self, url: &str, user_agent: &str) -> CrawlResult<(String, Url)> {
        debug!(url = %url, "fetching");
        let response = self
            .client
            .get(url)
            .header("User-Agent", user_agent)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CrawlError::Timeout {
                        url: url.to_string(),
                    }
                } else {
                    CrawlError::Http(Box::new(e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::Http(Box::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("HTTP {status}"),
            ))));
        }

        let final_url = response.url().clone();
        let html = response
            .text()
            .await
            .map_err(|e| CrawlError::Http(Box::new(e)))?;
        Ok((html, final_url))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn crawl(&self, seed_url: &str, config: &CrawlConfig) -> CrawlResult<Crawled> {
        let seed = parse_crawlable(seed_url).ok_or_else(|| CrawlError::InvalidUrl {
            url: seed_url.to_string(),
        })?;
        let seed = normalize_url(seed);
        let seed_domain = seed
            .host_str()
            .map(registered_domain)
            .unwrap_or_default();

        info!(
            seed = %seed,
            max_pages = config.max_pages,
            max_depth = config.max_depth,
            "crawl starting"
        );

        let mut frontier = BinaryHeap::new();
        let mut enqueued: HashSet<String> = HashSet::new();
        let mut result = Crawled::default();
        let mut seq = 0u64;

        enqueued.insert(seed.to_string());
        frontier.push(Candidate {
            score: 1.0,
            seq,
            url: seed,
            depth: 0,
        });

        while let Some(candidate) = frontier.pop() {
            if result.pages.len() >= config.max_pages {
                break;
            }

            let (html, final_url) =
                match self.fetch_page(candidate.url.as_str(), &config.user_agent).await {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        warn!(url = %candidate.url, error = %e, "fetch failed, dropping page");
                        result.failed_fetches += 1;
                        continue;
                    }
                };

            if expands_frontier(candidate.depth, config.max_depth) {
                for (href, text) in extract_links(&final_url, &html) {
                    let Some(link) = parse_crawlable(&href) else {
                        continue;
                    };
                    let link = normalize_url(link);
                    if !config.include_external {
                        let domain = link.host_str().map(registered_domain).unwrap_or_default();
                        if domain != seed_domain {
                            continue;
                        }
                    }
                    if !enqueued.insert(link.to_string()) {
                        continue;
                    }
                    seq += 1;
                    let score = link_score(&text, link.as_str(), candidate.depth + 1, config);
                    frontier.push(Candidate {
                        score,
                        seq,
                        url: link,
                        depth: candidate.depth + 1,
                    });
                }
            }

            let title = extract_title(&html).unwrap_or_default();
            let cleaned = clean_html(&html);
            debug!(
                url = %candidate.url,
                depth = candidate.depth,
                content_length = cleaned.len(),
                "page yielded"
            );
            result.pages.push(
                CrawledPage::new(candidate.url.to_string(), cleaned)
                    .with_title(title)
                    .with_depth(candidate.depth),
            );

            if config.rate_limit_ms > 0 && !frontier.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(config.rate_limit_ms)).await;
            }
        }

        info!(
            pages = result.pages.len(),
            failed = result.failed_fetches,
            "crawl completed"
        );
        Ok(result)
    }
}

/// Whether links found at `parent_depth` join the frontier. A link at
/// depth d+1 is only worth queueing if it will be yielded, i.e.
/// d+1 < max_depth; with the seed at depth 0, max_depth=1 yields the
/// seed alone.
fn expands_frontier(parent_depth: usize, max_depth: usize) -> bool {
    parent_depth + 1 < max_depth
}

/// Parse a URL and accept only http/https.
fn parse_crawlable(url: &str) -> Option<Url> {
    let parsed = Url::parse(url).ok()?;
    matches!(parsed.scheme(), "http" | "https").then_some(parsed)
}

/// Canonical form used for dedup and cache keys: the `url` crate
/// already lowercases scheme/host and drops default ports; we strip
/// the fragment on top.
fn normalize_url(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

/// Registered domain approximated as the last two host labels
/// (`docs.example.com` -> `example.com`).
fn registered_domain(host: &str) -> String {
    let labels: Vec<&str> = host.rsplitn(3, '.').collect();
    match labels.as_slice() {
        [tld, sld, ..] => format!("{sld}.{tld}"),
        _ => host.to_string(),
    }
}

/// Weighted link priority: keyword matches against link text and URL,
/// blended with a depth penalty.
fn link_score(text: &str, url: &str, depth: usize, config: &CrawlConfig) -> f32 {
    let structural = 1.0 / (1.0 + depth as f32);
    let keyword = keyword_score(text, url, &config.keywords);
    config.keyword_weight * keyword + (1.0 - config.keyword_weight) * structural
}

/// Fraction of keywords appearing (case-insensitive substring) in the
/// link text or URL. Zero when no keywords are configured.
fn keyword_score(text: &str, url: &str, keywords: &[String]) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let haystack = format!("{text} {url}").to_lowercase();
    let matched = keywords
        .iter()
        .filter(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
        .count();
    matched as f32 / keywords.len() as f32
}

/// Extract anchors as (absolute URL, link text) pairs.
fn extract_links(base_url: &Url, html: &str) -> Vec<(String, String)> {
    let anchor_pattern =
        regex::Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap();
    let tag_pattern = regex::Regex::new(r"<[^>]+>").unwrap();

    let mut links = Vec::new();
    for cap in anchor_pattern.captures_iter(html) {
        let href = cap.get(1).map(|m| m.as_str()).unwrap_or_default();

        // Skip anchors, javascript, mailto, tel
        if href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }

        if let Ok(resolved) = base_url.join(href) {
            let text = tag_pattern
                .replace_all(cap.get(2).map(|m| m.as_str()).unwrap_or_default(), " ")
                .trim()
                .to_string();
            links.push((resolved.to_string(), text));
        }
    }
    links
}

/// Extract the `<title>` text.
fn extract_title(html: &str) -> Option<String> {
    let title_pattern = regex::Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok()?;
    title_pattern
        .captures(html)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Convert HTML to a Markdown-ish textual rendering with navigation
/// chrome removed. The content hash downstream is computed over this
/// output.
fn clean_html(html: &str) -> String {
    let mut text = html.to_string();

    // Remove scripts, styles, and chrome containers
    for pattern in [
        r"(?is)<script[^>]*>.*?</script>",
        r"(?is)<style[^>]*>.*?</style>",
        r"(?is)<nav[^>]*>.*?</nav>",
        r"(?is)<header[^>]*>.*?</header>",
        r"(?is)<footer[^>]*>.*?</footer>",
        r"(?is)<aside[^>]*>.*?</aside>",
    ] {
        text = regex::Regex::new(pattern)
            .unwrap()
            .replace_all(&text, "")
            .to_string();
    }

    // Convert headers
    let h1_pattern = regex::Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").unwrap();
    let h2_pattern = regex::Regex::new(r"(?is)<h2[^>]*>(.*?)</h2>").unwrap();
    let h3_pattern = regex::Regex::new(r"(?is)<h3[^>]*>(.*?)</h3>").unwrap();
    text = h1_pattern.replace_all(&text, "# $1\n").to_string();
    text = h2_pattern.replace_all(&text, "## $1\n").to_string();
    text = h3_pattern.replace_all(&text, "### $1\n").to_string();

    // Convert paragraphs and line breaks
    let p_pattern = regex::Regex::new(r"(?is)<p[^>]*>(.*?)</p>").unwrap();
    let br_pattern = regex::Regex::new(r"(?i)<br\s*/?>").unwrap();
    text = p_pattern.replace_all(&text, "$1\n\n").to_string();
    text = br_pattern.replace_all(&text, "\n").to_string();

    // Convert links and list items
    let link_pattern =
        regex::Regex::new(r#"(?is)<a[^>]*href=["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap();
    text = link_pattern.replace_all(&text, "[$2]($1)").to_string();
    let li_pattern = regex::Regex::new(r"(?is)<li[^>]*>(.*?)</li>").unwrap();
    text = li_pattern.replace_all(&text, "- $1\n").to_string();

    // Preserve code blocks as fences
    let pre_pattern = regex::Regex::new(r"(?is)<pre[^>]*>(.*?)</pre>").unwrap();
    text = pre_pattern.replace_all(&text, "```\n$1\n```\n").to_string();
    let code_pattern = regex::Regex::new(r"(?is)<code[^>]*>(.*?)</code>").unwrap();
    text = code_pattern.replace_all(&text, "`$1`").to_string();

    // Remove remaining tags
    let tag_pattern = regex::Regex::new(r"<[^>]+>").unwrap();
    text = tag_pattern.replace_all(&text, "").to_string();

    // Clean up whitespace
    let multi_newline = regex::Regex::new(r"\n{3,}").unwrap();
    text = multi_newline.replace_all(&text, "\n\n").to_string();

    // Decode common HTML entities
    text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_links() {
        let base_url = Url::parse("https://example.test/page").unwrap();
        let html = r##"
            <a href="/about">About us</a>
            <a href="https://example.test/contact">Contact</a>
            <a href="#section">Anchor</a>
            <a href="javascript:void(0)">JS</a>
            <a href="mailto:hi@example.test">Mail</a>
        "##;

        let links = extract_links(&base_url, html);
        let urls: Vec<&str> = links.iter().map(|(u, _)| u.as_str()).collect();

        assert!(urls.contains(&"https://example.test/about"));
        assert!(urls.contains(&"https://example.test/contact"));
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].1, "About us");
    }

    #[test]
    fn test_clean_html_strips_chrome() {
        let html = r#"
            <nav><a href="/">Home</a></nav>
            <header>Site header</header>
            <h1>API Reference</h1>
            <p>Call <code>connect()</code> first.</p>
            <footer>Copyright</footer>
            <script>track();</script>
        "#;

        let cleaned = clean_html(html);
        assert!(cleaned.contains("# API Reference"));
        assert!(cleaned.contains("`connect()`"));
        assert!(!cleaned.contains("Site header"));
        assert!(!cleaned.contains("Copyright"));
        assert!(!cleaned.contains("track()"));
        assert!(!cleaned.contains("Home"));
    }

    #[test]
    fn test_extract_title() {
        let html = "<html><head><title> API Docs </title></head></html>";
        assert_eq!(extract_title(html), Some("API Docs".to_string()));
        assert_eq!(extract_title("<html><body>none</body></html>"), None);
    }

    #[test]
    fn test_normalize_url() {
        let url = Url::parse("HTTPS://Example.TEST:443/Docs#intro").unwrap();
        let normalized = normalize_url(url);
        assert_eq!(normalized.as_str(), "https://example.test/Docs");
    }

    #[test]
    fn test_registered_domain() {
        assert_eq!(registered_domain("docs.example.test"), "example.test");
        assert_eq!(registered_domain("example.test"), "example.test");
        assert_eq!(registered_domain("localhost"), "localhost");
    }

    #[test]
    fn test_depth_gate() {
        // max_depth=1: the seed is fetched, nothing is enqueued.
        assert!(!expands_frontier(0, 1));
        // max_depth=2: seed links are yielded but not expanded further.
        assert!(expands_frontier(0, 2));
        assert!(!expands_frontier(1, 2));
    }

    #[test]
    fn test_keyword_score_empty_is_zero() {
        assert_eq!(keyword_score("API guide", "https://x/api", &[]), 0.0);
    }

    #[test]
    fn test_keyword_score_case_insensitive() {
        let keywords = vec!["API".to_string(), "tutorial".to_string()];
        let score = keyword_score("api reference", "https://example.test/ref", &keywords);
        assert!((score - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_candidate_ordering() {
        let url = Url::parse("https://example.test/").unwrap();
        let mut heap = BinaryHeap::new();
        heap.push(Candidate {
            score: 0.2,
            seq: 1,
            url: url.clone(),
            depth: 1,
        });
        heap.push(Candidate {
            score: 0.9,
            seq: 2,
            url: url.clone(),
            depth: 1,
        });
        // Same score as seq=2 but discovered later
        heap.push(Candidate {
            score: 0.9,
            seq: 3,
            url,
            depth: 1,
        });

        assert_eq!(heap.pop().unwrap().seq, 2); // highest score, earliest
        assert_eq!(heap.pop().unwrap().seq, 3);
        assert_eq!(heap.pop().unwrap().seq, 1);
    }

    #[test]
    fn test_link_score_empty_keywords_is_structural_only() {
        let config = CrawlConfig::default().with_keyword_weight(0.7);
        let score = link_score("text", "https://example.test/a", 1, &config);
        // keyword term contributes 0, leaving (1 - 0.7) * 1/(1+1)
        assert!((score - 0.3 * 0.5).abs() < 1e-6);
    }
}
