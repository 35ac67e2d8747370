//! Output directory writer.
//!
//! One human-readable Markdown file per retained page plus an
//! `index.json` covering every page of the run, so all persisted
//! pages are discoverable from the summary.

use std::path::Path;

use tracing::debug;

use crate::cache::url_hash;
use crate::types::page::ExtractionPayload;
use crate::types::report::PageReport;

const SLUG_MAX_LEN: usize = 80;

/// Filename for a page: sanitized URL slug plus the 12-hex URL hash,
/// which keeps same-slug pages from colliding.
pub fn output_filename(url: &str) -> String {
    format!("{}-{}.md", slug(url), url_hash(url))
}

fn slug(url: &str) -> String {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");

    let mut out = String::with_capacity(trimmed.len());
    let mut last_dash = true;
    for c in trimmed.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= SLUG_MAX_LEN {
            break;
        }
    }

    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        "page".to_string()
    } else {
        out
    }
}

/// Write one retained page as Markdown; returns the filename.
pub async fn write_page(
    dir: &Path,
    report: &PageReport,
    payload: &ExtractionPayload,
) -> std::io::Result<String> {
    let filename = output_filename(&report.url);

    let heading = if report.title.is_empty() {
        report.url.as_str()
    } else {
        report.title.as_str()
    };

    let mut body = String::new();
    body.push_str(&format!("# {heading}\n\n"));
    body.push_str(&format!("> Source: {}\n", report.url));
    body.push_str(&format!(
        "> Extracted: {}\n\n",
        payload.extraction_timestamp.to_rfc3339()
    ));
    body.push_str(&payload.content.join("\n\n"));
    body.push('\n');

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(&filename);
    tokio::fs::write(&path, body).await?;
    debug!(url = %report.url, path = %path.display(), "wrote page output");
    Ok(filename)
}

/// Write `index.json` listing every page of the run in fetch order.
pub async fn write_summary(dir: &Path, reports: &[PageReport]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let json = serde_json::to_vec_pretty(reports).map_err(std::io::Error::other)?;
    tokio::fs::write(dir.join("index.json"), json).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::report::PageStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn report(url: &str) -> PageReport {
        PageReport {
            url: url.to_string(),
            title: "API Docs".to_string(),
            depth: 0,
            included: true,
            decision_explanation: String::new(),
            status: PageStatus::Extracted,
            crawl_timestamp: Utc::now(),
            extracted_at: Some(Utc::now()),
            output_file: None,
            error: None,
        }
    }

    #[test]
    fn test_slug_sanitizes() {
        assert_eq!(
            slug("https://example.test/docs/API_v2?x=1"),
            "example-test-docs-api-v2-x-1"
        );
        assert_eq!(slug("https://"), "page");
    }

    #[test]
    fn test_output_filename_distinguishes_same_slug() {
        let a = output_filename("https://example.test/docs");
        let b = output_filename("https://example.test/docs/");
        assert_ne!(a, b);
        assert!(a.ends_with(".md"));
    }

    #[tokio::test]
    async fn test_write_page_and_summary() {
        let dir = TempDir::new().unwrap();
        let report = report("https://example.test/docs");
        let payload = ExtractionPayload::new(
            "https://example.test/docs",
            vec!["## Install".to_string(), "Run it.".to_string()],
        );

        let filename = write_page(dir.path(), &report, &payload).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join(&filename)).unwrap();
        assert!(written.contains("# API Docs"));
        assert!(written.contains("> Source: https://example.test/docs"));
        assert!(written.contains("## Install"));

        write_summary(dir.path(), &[report]).await.unwrap();
        let summary = std::fs::read_to_string(dir.path().join("index.json")).unwrap();
        let parsed: Vec<PageReport> = serde_json::from_str(&summary).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].url, "https://example.test/docs");
    }
}
