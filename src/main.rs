//! CLI entry point for casefile.

use std::io::{self, IsTerminal, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use casefile_core::{
    CaseOrchestrator, CaseRequest, CollectorConfig, Fetcher, HttpClient, RateLimitedTransport,
    ResolutionEngine, RunSummary, StaticPageProvider,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

mod app_config;
mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = build_config(&args)?;
    let requests = read_requests(&args)?;
    if requests.is_empty() {
        info!("No input provided. Pass detail-page URLs, pipe them via stdin, or use --plan.");
        return Ok(());
    }
    info!(cases = requests.len(), output = %config.output_dir.display(), "casefile starting");

    let transport = Arc::new(
        RateLimitedTransport::new(config.transport_settings())
            .context("Failed to start transport")?,
    );
    let client: Arc<dyn Fetcher> = Arc::new(
        HttpClient::new(config.http_client_settings()).context("Failed to build HTTP client")?,
    );
    let provider = Arc::new(StaticPageProvider::new(Arc::clone(&transport), client));

    let mut engine = ResolutionEngine::new(Arc::clone(&transport), config.resolve_settings());
    if let Some(pickup) = config.folder_pickup() {
        engine = engine.with_pickup(pickup);
    }
    let orchestrator = CaseOrchestrator::new(provider, engine, config.case_settings());

    let progress = progress_bar(requests.len(), args.quiet);
    let summary = orchestrator
        .run(&requests, |url, ok| {
            progress.set_message(if ok { "ok" } else { "failed" });
            debug!(%url, ok, "case finished");
            progress.inc(1);
        })
        .await;
    progress.finish_and_clear();

    let stats = transport.stats();
    info!(
        completed = stats.completed(),
        failed = stats.failed(),
        retried = stats.retried(),
        "transport totals"
    );
    print_summary(&summary, args.quiet);

    if summary.cases_ok() == 0 && summary.cases_failed() > 0 {
        anyhow::bail!("all {} cases failed", summary.cases_failed());
    }
    Ok(())
}

fn build_config(args: &Args) -> Result<CollectorConfig> {
    let mut config = CollectorConfig::default();
    if let Some((path, file)) = app_config::load_file_config(args.config.as_deref())? {
        debug!(path = %path.display(), "config file loaded");
        file.apply(&mut config)
            .with_context(|| format!("Invalid config file '{}'", path.display()))?;
    }
    app_config::apply_args(args, &mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn read_requests(args: &Args) -> Result<Vec<CaseRequest>> {
    if let Some(plan) = &args.plan {
        return read_plan(plan);
    }

    let input = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read stdin")?;
        buffer
    } else {
        String::new()
    };

    let mut requests = Vec::new();
    for line in input.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("http://") || line.starts_with("https://") {
            requests.push(CaseRequest::scan(line));
        } else {
            warn!(input = %line, "Skipped input that is not an http(s) URL");
        }
    }
    Ok(requests)
}

fn read_plan(path: &Path) -> Result<Vec<CaseRequest>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read plan '{}'", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("Invalid plan '{}'", path.display()))
}

fn progress_bar(len: usize, quiet: bool) -> ProgressBar {
    if quiet || !io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:30} {pos}/{len} cases {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

fn print_summary(summary: &RunSummary, quiet: bool) {
    if quiet {
        return;
    }
    println!(
        "Cases: {} ok, {} failed",
        summary.cases_ok(),
        summary.cases_failed()
    );
    for report in &summary.reports {
        let stats = report.manifest.stats();
        let missing = report.manifest.missing();
        println!(
            "  {}: {} files, {} links, {} failed{}",
            report.case_id,
            stats.succeeded,
            stats.link_only,
            stats.failed,
            if missing.is_empty() {
                String::new()
            } else {
                format!(", missing {}", missing.join(","))
            }
        );
    }
    for failure in &summary.failures {
        println!("  FAILED {}: {}", failure.url, failure.reason);
    }
    if summary.missing.is_empty() {
        println!("Missing categories: none");
    } else {
        let missing: Vec<&str> = summary.missing.iter().map(String::as_str).collect();
        println!("Missing categories: {}", missing.join(", "));
    }
}
