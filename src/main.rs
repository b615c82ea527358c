mod batch;
mod capture;
mod config;
mod detect;
mod error;
mod ledger;
mod render;
mod sink;
mod trackerdb;
mod urls;
mod utils;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::Settings;
use batch::{BatchController, BatchWindow, RetryPolicy};
use detect::DetectionEngine;
use ledger::{ProgressLedger, LEDGER_FILE};
use render::{BrowserlessRenderer, InteractionProfile};
use sink::ResultSink;
use trackerdb::TrackerDatabase;
use urls::UrlEntry;

const BATCH_TEST_URLS: usize = 300;
const BATCH_TEST_SIZE: usize = 100;
const BATCH_TEST_BATCHES: usize = 3;

#[derive(Parser)]
#[command(name = "gtm_scanner", about = "GTM, consent-mode and tracker detection over ranked sites")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in 4-URL smoke set
    Smoke {
        #[arg(long)]
        session: Option<String>,
    },
    /// Run the built-in 13-URL comprehensive set
    Comprehensive {
        #[arg(long)]
        session: Option<String>,
    },
    /// First 300 URLs of the universe, batches 1-3 by default
    BatchTest {
        #[arg(long, default_value_t = 1)]
        start_batch: usize,
        #[arg(long, default_value_t = BATCH_TEST_BATCHES)]
        num_batches: usize,
        #[arg(long, default_value_t = BATCH_TEST_SIZE)]
        batch_size: usize,
        #[arg(long, default_value = "batch_test")]
        session: String,
    },
    /// Full universe; re-running the same session resumes it
    Run {
        #[arg(long, default_value_t = 1)]
        start_batch: usize,
        /// Number of batches to run (default: through the last)
        #[arg(long)]
        num_batches: Option<usize>,
        /// URLs per batch (default: from settings)
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, default_value = "full")]
        session: String,
        /// URL list (default: from settings)
        #[arg(long)]
        urls: Option<PathBuf>,
    },
    /// Render and analyze a single URL without touching any ledger
    Check { url: String },
    /// Concatenate a session's batch outputs into combined.jsonl
    Combine {
        #[arg(long)]
        session: String,
    },
    /// Ledger counts for a session
    Stats {
        #[arg(long)]
        session: String,
    },
    /// Write a session's failed URLs to a text file
    ExportFailed {
        #[arg(long)]
        session: String,
        /// Output path (default: <session>/failed_urls.txt)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Tracker database maintenance
    Trackerdb {
        #[command(subcommand)]
        action: TrackerdbAction,
    },
}

#[derive(Subcommand)]
enum TrackerdbAction {
    /// Resolve the snapshot and show where it came from
    Status,
    /// Force a remote fetch and rewrite the cache
    Refresh,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Smoke { session } => {
            let session = session.unwrap_or_else(|| timestamped("smoke"));
            let urls = urls::smoke_set();
            let size = urls.len();
            run_session(&settings, &urls, &session, size, BatchWindow::default()).await
        }
        Commands::Comprehensive { session } => {
            let session = session.unwrap_or_else(|| timestamped("comprehensive"));
            let urls = urls::comprehensive_set();
            let size = urls.len();
            run_session(&settings, &urls, &session, size, BatchWindow::default()).await
        }
        Commands::BatchTest {
            start_batch,
            num_batches,
            batch_size,
            session,
        } => {
            let urls = urls::load_universe(&settings.url_list_path(), Some(BATCH_TEST_URLS))?;
            let window = BatchWindow {
                start_batch,
                num_batches: Some(num_batches),
            };
            run_session(&settings, &urls, &session, batch_size, window).await
        }
        Commands::Run {
            start_batch,
            num_batches,
            batch_size,
            session,
            urls: list,
        } => {
            let list = list.unwrap_or_else(|| settings.url_list_path());
            let urls = urls::load_universe(&list, None)?;
            let window = BatchWindow {
                start_batch,
                num_batches,
            };
            let size = batch_size.unwrap_or(settings.batch_size);
            run_session(&settings, &urls, &session, size, window).await
        }
        Commands::Check { url } => check(&settings, &url).await,
        Commands::Combine { session } => {
            let dir = settings.session_dir(&session);
            let (path, records) = sink::combine(&dir)
                .with_context(|| format!("Failed to combine session {session}"))?;
            println!("Combined {} records into {}", records, path.display());
            Ok(())
        }
        Commands::Stats { session } => stats(&settings, &session),
        Commands::ExportFailed { session, out } => {
            let dir = settings.session_dir(&session);
            let ledger = ProgressLedger::open_existing(&dir)?;
            let failed = ledger.failed_urls()?;
            let out = out.unwrap_or_else(|| dir.join("failed_urls.txt"));
            let mut body = failed.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            utils::write_atomic(&out, body.as_bytes())?;
            println!("Wrote {} failed URLs to {}", failed.len(), out.display());
            Ok(())
        }
        Commands::Trackerdb { action } => {
            let mut db = TrackerDatabase::from_settings(&settings)?;
            match action {
                TrackerdbAction::Status => {
                    db.load().await;
                }
                TrackerdbAction::Refresh => {
                    db.refresh()
                        .await
                        .context("Trackerdb refresh failed; cache left unchanged")?;
                }
            }
            if let Some(s) = db.status() {
                println!("Source:    {}", s.source);
                println!("Release:   {}", s.release.as_deref().unwrap_or("-"));
                println!("Fetched:   {}", s.fetched_at.to_rfc3339());
                println!("Patterns:  {}", s.pattern_count);
                println!("Domains:   {}", s.domain_count);
                println!("Degraded:  {}", s.degraded);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run_session(
    settings: &Settings,
    urls: &[UrlEntry],
    session: &str,
    batch_size: usize,
    window: BatchWindow,
) -> Result<()> {
    let dir = settings.session_dir(session);
    let ledger = ProgressLedger::open(&dir.join(LEDGER_FILE))
        .with_context(|| format!("Failed to open ledger in {}", dir.display()))?;

    let batch_size = match ledger.batch_size()? {
        Some(stored) if stored != batch_size => {
            warn!(
                requested = batch_size,
                stored, "Session was created with a different batch size, keeping it"
            );
            stored
        }
        _ => batch_size,
    };

    let mut db = TrackerDatabase::from_settings(settings)?;
    let snapshot = db.load().await;

    let renderer = BrowserlessRenderer::from_settings(settings)?;
    let mut controller = BatchController::new(
        renderer,
        DetectionEngine::from_settings(settings),
        snapshot,
        ledger,
        ResultSink::new(&dir),
        InteractionProfile::from_settings(settings),
        RetryPolicy::from_settings(settings),
    );

    info!(session, urls = urls.len(), "Session {}", dir.display());
    let summary = tokio::select! {
        res = controller.run(urls, batch_size, window) => res?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; the in-flight URL stays in_progress and is redone on resume");
            println!("Interrupted. Re-run the same command to resume session '{session}'.");
            return Ok(());
        }
    };

    println!(
        "Session '{}': {} processed ({} analyzed, {} degenerate, {} failed)",
        session,
        summary.processed(),
        summary.analyzed,
        summary.degenerate,
        summary.failed
    );
    println!(
        "Batches: {} run, {} already flushed, {} aborted{}",
        summary.batches_run,
        summary.batches_skipped,
        summary.batches_aborted,
        if summary.reset > 0 {
            format!(" ({} interrupted URLs resumed)", summary.reset)
        } else {
            String::new()
        }
    );
    println!("Outputs in {}", dir.join(sink::BATCH_DIR).display());
    Ok(())
}

async fn check(settings: &Settings, url: &str) -> Result<()> {
    let mut db = TrackerDatabase::from_settings(settings)?;
    let snapshot = db.load().await;
    let renderer = BrowserlessRenderer::from_settings(settings)?;
    let engine = DetectionEngine::from_settings(settings);
    let entry = UrlEntry {
        index: 0,
        url: url.to_string(),
        rank: 1,
        platform: None,
    };

    let record = match batch::render_with_retry(
        &renderer,
        url,
        &InteractionProfile::from_settings(settings),
        &RetryPolicy::from_settings(settings),
    )
    .await
    {
        Ok((capture, attempts)) => engine.analyze(&entry, &capture, &snapshot, attempts),
        Err((e, attempts)) => engine.failed(&entry, &e.to_string(), attempts, &snapshot),
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn stats(settings: &Settings, session: &str) -> Result<()> {
    let ledger = ProgressLedger::open_existing(&settings.session_dir(session))
        .with_context(|| format!("No session named '{session}'"))?;
    let s = ledger.stats()?;
    println!("Total:       {}", s.total());
    println!("Done:        {}", s.done);
    println!("Failed:      {}", s.failed);
    println!("Pending:     {}", s.pending);
    println!("In progress: {}", s.in_progress);

    if !s.batches.is_empty() {
        println!("\n{:>6} | {:>5} | {:>5} | {:>6} | {:<7}", "Batch", "URLs", "Done", "Failed", "Flushed");
        println!("{}", "-".repeat(42));
        for b in &s.batches {
            println!(
                "{:>6} | {:>5} | {:>5} | {:>6} | {:<7}",
                b.batch_id,
                b.total,
                b.done,
                b.failed,
                if b.flushed { "yes" } else { "no" }
            );
        }
    }
    Ok(())
}

fn timestamped(prefix: &str) -> String {
    format!("{}_{}", prefix, Utc::now().format("%Y%m%d_%H%M%S"))
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn cli_parses_run_window() {
        let cli = Cli::try_parse_from([
            "gtm_scanner",
            "run",
            "--start-batch",
            "4",
            "--num-batches",
            "2",
            "--batch-size",
            "50",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                start_batch,
                num_batches,
                batch_size,
                session,
                ..
            } => {
                assert_eq!(start_batch, 4);
                assert_eq!(num_batches, Some(2));
                assert_eq!(batch_size, Some(50));
                assert_eq!(session, "full");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_parses_trackerdb_refresh() {
        let cli = Cli::try_parse_from(["gtm_scanner", "trackerdb", "refresh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Trackerdb {
                action: TrackerdbAction::Refresh
            }
        ));
    }
}
