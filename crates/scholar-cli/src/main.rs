use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use scholar_core::CrawlMode;
use scholar_crawl::{crawl_profile, write_document, CrawlConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scholar-cli")]
#[command(about = "Crawl one Google Scholar profile into a JSON document")]
struct Cli {
    /// Profile identifier, the `user=` value of the profile URL.
    scholar_id: String,

    /// Only emit the profile header, skipping the publication listing.
    #[arg(short, long)]
    info: bool,

    /// Write the document here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// YAML file overlaying the SCHOLAR_* environment settings.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fetch each publication's detail page and merge it in.
    #[arg(long)]
    detail: bool,

    #[arg(long)]
    max_load_more: Option<usize>,
}

impl Cli {
    fn mode(&self) -> CrawlMode {
        if self.info {
            CrawlMode::ProfileOnly
        } else {
            CrawlMode::FullListing
        }
    }

    fn crawl_config(&self) -> Result<CrawlConfig> {
        let mut config = CrawlConfig::from_env();
        if let Some(path) = &self.config {
            config = config.with_file(path)?;
        }
        if self.detail {
            config.detail_enrichment = true;
        }
        if let Some(max) = self.max_load_more {
            config.max_load_more = max;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.crawl_config()?;
    let mode = cli.mode();

    info!(scholar_id = %cli.scholar_id, ?mode, "starting crawl");
    let report = crawl_profile(config, &cli.scholar_id, mode).await?;
    write_document(&report.document, cli.output.as_deref())?;

    if let Some(path) = &cli.output {
        info!(path = %path.display(), "document written");
    }
    Ok(())
}
