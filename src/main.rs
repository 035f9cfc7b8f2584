//! feed-harvest: harvest records and media from an infinite-scroll feed in
//! an already authenticated browser session.

use anyhow::{bail, Context, Result};
use clap::Parser;
use feed_harvester::harvest::{
    CsvSink, DirectoryStore, HarvestPipeline, HarvestSummary, HttpSource, MemorySession,
    TracingProgress, WebDriverSession,
};
use feed_harvester::{logging, BrowserSession, Cancellation, HarvestConfig, RunMode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "feed-harvest")]
#[command(about = "Expand an infinite-scroll feed, extract its records and download their media")]
#[command(version)]
struct Cli {
    /// WebDriver server URL (e.g. http://localhost:9515)
    #[arg(long, required_unless_present = "replay")]
    webdriver: Option<String>,

    /// Id of the logged-in WebDriver session to attach to
    #[arg(long, required_unless_present = "replay")]
    session: Option<String>,

    /// Run mode: test (current render, capped) or full (expand to convergence)
    #[arg(short, long, default_value = "test")]
    mode: RunMode,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory (overrides run.output_dir)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Navigate here before harvesting (overrides feed.url)
    #[arg(long)]
    feed_url: Option<String>,

    /// Replay a captured snapshot (JSON array) instead of attaching to a browser
    #[arg(long, conflicts_with_all = ["webdriver", "session"])]
    replay: Option<PathBuf>,

    /// Per-request timeout for WebDriver calls, in seconds
    #[arg(long, default_value = "120")]
    request_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HarvestConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => HarvestConfig::default(),
    };
    if let Some(output) = cli.output.clone() {
        config.run.output_dir = output;
    }
    if let Some(url) = cli.feed_url.clone() {
        config.feed.url = Some(url);
    }
    config.validate().context("invalid configuration")?;

    logging::init(&config.logging).context("installing log subscriber")?;

    let session = open_session(&cli).await?;

    let cancel = Cancellation::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next boundary");
            on_signal.cancel();
        }
    });

    let records_path = config.records_path(cli.mode);
    let assets_dir = config.assets_dir(cli.mode);
    info!(
        mode = %cli.mode,
        records = %records_path.display(),
        assets = %assets_dir.display(),
        "Starting harvest"
    );

    let source = HttpSource::new(&config.fetch).context("building HTTP client")?;
    let pipeline = HarvestPipeline::new(
        &config,
        CsvSink::new(&records_path),
        Arc::new(source),
        Arc::new(DirectoryStore::new(&assets_dir)),
    )
    .with_progress(Arc::new(TracingProgress))
    .with_cancellation(cancel);

    let summary = pipeline
        .run(session.as_ref(), cli.mode)
        .await
        .context("harvest aborted")?;

    print_summary(&summary, &records_path, &assets_dir);
    Ok(())
}

async fn open_session(cli: &Cli) -> Result<Box<dyn BrowserSession>> {
    if let Some(path) = &cli.replay {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let snapshot: serde_json::Value =
            serde_json::from_str(&raw).context("snapshot is not valid JSON")?;
        let session = MemorySession::from_snapshot(snapshot)?;
        return Ok(Box::new(session));
    }

    let (Some(endpoint), Some(id)) = (&cli.webdriver, &cli.session) else {
        bail!("--webdriver and --session are required unless --replay is given");
    };
    let session =
        WebDriverSession::attach(endpoint, id, Duration::from_secs(cli.request_timeout))
            .with_context(|| format!("attaching to session {} at {}", id, endpoint))?;
    Ok(Box::new(session))
}

fn print_summary(summary: &HarvestSummary, records_path: &std::path::Path, assets_dir: &std::path::Path) {
    println!("Harvest ({}) finished in {:.1}s", summary.mode, summary.total_duration_ms as f64 / 1000.0);
    if let Some(expansion) = &summary.expansion {
        println!(
            "  expansion:  {} -> {} containers in {} iterations ({:?}, {} ms)",
            expansion.initial_count,
            expansion.final_count,
            expansion.iterations,
            expansion.reason,
            summary.expansion_duration_ms
        );
    }
    println!(
        "  records:    {} stored, {} duplicates, {} failed ({} processed, {} ms)",
        summary.records_stored,
        summary.duplicates,
        summary.failures,
        summary.records_processed,
        summary.extraction_duration_ms
    );
    println!(
        "  assets:     {} downloaded, {} already present, {} failed of {} ({} ms)",
        summary.assets.succeeded - summary.assets.skipped,
        summary.assets.skipped,
        summary.assets.failed,
        summary.assets_queued,
        summary.fetch_duration_ms
    );
    println!("  records file: {}", records_path.display());
    println!("  assets dir:   {}", assets_dir.display());
    if summary.cancelled {
        println!("  (cancelled before completion)");
    }
}
