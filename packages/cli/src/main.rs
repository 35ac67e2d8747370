//! docpipe command line.
//!
//! Parses flags, merges environment defaults, wires up the pipeline,
//! and maps outcomes to exit codes: 0 success, 1 run-level fatal
//! error, 2 invalid invocation.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use docpipe::{
    CrawlConfig, ExtractorModelConfig, FilterModelConfig, HttpFetcher, OpenAiLm, Pipeline,
    PipelineConfig, RunOptions, RunSummary,
};

#[derive(Parser, Debug)]
#[command(name = "docpipe")]
#[command(about = "Crawl a documentation site and extract structured content with LM assistance")]
#[command(version)]
struct Cli {
    /// Seed URL to start crawling from
    seed_url: String,

    /// Directory for per-page Markdown and the run summary
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Comma-separated keywords that raise crawl priority
    #[arg(long, value_delimiter = ',')]
    keywords: Vec<String>,

    /// Weight of keyword matches in link scoring, in [0, 1]
    #[arg(long, default_value_t = 0.6)]
    keyword_weight: f32,

    /// Maximum crawl depth (seed is depth 0)
    #[arg(long, env = "MAX_DEPTH", default_value_t = 2)]
    max_depth: usize,

    /// Maximum number of pages to crawl
    #[arg(long, env = "MAX_PAGES", default_value_t = 25)]
    max_pages: usize,

    /// Follow links outside the seed's registered domain
    #[arg(long, env = "INCLUDE_EXTERNAL")]
    include_external: bool,

    /// Topic the relevance filter judges pages against
    #[arg(long)]
    target_topic: Option<String>,

    /// Run the LM relevance filter (requires --target-topic)
    #[arg(long)]
    enable_filtering: bool,

    /// Cache root directory
    #[arg(long, default_value = "extracted-docs")]
    cache_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Clap exits with code 2 on unrecognized or missing arguments.
    let cli = Cli::parse();

    let options = RunOptions {
        seed_url: cli.seed_url.clone(),
        output_dir: cli.output_dir.clone(),
        target_topic: cli.target_topic.clone(),
        filtering_enabled: cli.enable_filtering,
    };

    // Invocation-level constraint violations exit 2 before any
    // network activity.
    let crawl = crawl_config(&cli);
    if let Err(e) = options.validate().and_then(|_| crawl.validate()) {
        eprintln!("error: {e}");
        return ExitCode::from(2);
    }

    match run(&cli, crawl, &options).await {
        Ok(summary) => {
            println!("{}", summary.render());
            if !summary.is_success() {
                warn!(
                    failed = summary.failed,
                    cancelled = summary.cancelled,
                    "run finished with per-page failures"
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: &Cli, crawl: CrawlConfig, options: &RunOptions) -> Result<RunSummary> {
    let lm = Arc::new(OpenAiLm::from_env().context("language model configuration")?);

    let mut config = PipelineConfig::default()
        .with_crawl(crawl)
        .with_extractor(extractor_config_from_env()?)
        .with_cache_dir(&cli.cache_dir);
    if cli.enable_filtering {
        config = config.with_filter(filter_config_from_env()?);
    }

    let mut pipeline = Pipeline::new(Arc::new(HttpFetcher::new()), lm.clone(), config);
    if cli.enable_filtering {
        pipeline = pipeline.with_filter_lm(lm);
    }

    // Ctrl-C drains in-flight work and returns the partial result.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining in-flight work");
            signal_cancel.cancel();
        }
    });

    pipeline
        .run_with_cancel(options, cancel)
        .await
        .context("pipeline run")
}

fn crawl_config(cli: &Cli) -> CrawlConfig {
    let mut crawl = CrawlConfig::default()
        .with_max_depth(cli.max_depth)
        .with_max_pages(cli.max_pages)
        .with_keywords(cli.keywords.iter().filter(|k| !k.trim().is_empty()))
        .with_keyword_weight(cli.keyword_weight);
    crawl.include_external = cli.include_external;
    crawl
}

fn extractor_config_from_env() -> Result<ExtractorModelConfig> {
    let mut config = ExtractorModelConfig::default();
    if let Ok(provider) = std::env::var("LLM_PROVIDER") {
        config.provider = provider;
    }
    if let Ok(raw) = std::env::var("LLM_TEMPERATURE") {
        config.temperature = raw
            .parse()
            .with_context(|| format!("invalid LLM_TEMPERATURE: {raw:?}"))?;
    }
    Ok(config)
}

fn filter_config_from_env() -> Result<FilterModelConfig> {
    let mut config = FilterModelConfig::default();
    if let Ok(provider) = std::env::var("FILTER_LLM_PROVIDER") {
        config.provider = provider;
    }
    if let Ok(raw) = std::env::var("FILTER_LLM_TEMPERATURE") {
        config.temperature = raw
            .parse()
            .with_context(|| format!("invalid FILTER_LLM_TEMPERATURE: {raw:?}"))?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_split_on_commas() {
        let cli = Cli::parse_from([
            "docpipe",
            "https://example.test/docs",
            "--keywords",
            "api,sdk, ,reference",
        ]);
        let crawl = crawl_config(&cli);
        assert_eq!(crawl.keywords, vec!["api", "sdk", "reference"]);
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["docpipe", "https://example.test/docs"]);
        assert_eq!(cli.max_depth, 2);
        assert_eq!(cli.max_pages, 25);
        assert!(!cli.include_external);
        assert!(!cli.enable_filtering);
        assert_eq!(cli.output_dir, PathBuf::from("output"));
        assert_eq!(cli.cache_dir, PathBuf::from("extracted-docs"));
    }

    #[test]
    fn test_missing_seed_is_a_usage_error() {
        let err = Cli::try_parse_from(["docpipe"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
