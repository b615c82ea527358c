use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use crate::capture::PageCapture;
use crate::config::Settings;
use crate::detect::{DetectionEngine, RecordStatus};
use crate::error::{CaptureError, PersistenceError};
use crate::ledger::ProgressLedger;
use crate::render::{InteractionProfile, Renderer};
use crate::sink::ResultSink;
use crate::trackerdb::TrackerSnapshot;
use crate::urls::UrlEntry;

/// A contiguous slice `[start, end)` of the universe. Ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub id: usize,
    pub start: usize,
    pub end: usize,
}

impl BatchPlan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

pub fn partition(total: usize, size: usize) -> Vec<BatchPlan> {
    let size = size.max(1);
    (0..total)
        .step_by(size)
        .enumerate()
        .map(|(i, start)| BatchPlan {
            id: i + 1,
            start,
            end: (start + size).min(total),
        })
        .collect()
}

/// Which batches of the partition to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    /// 1-based id of the first batch.
    pub start_batch: usize,
    /// `None` runs through the last batch.
    pub num_batches: Option<usize>,
}

impl Default for BatchWindow {
    fn default() -> Self {
        Self {
            start_batch: 1,
            num_batches: None,
        }
    }
}

impl BatchWindow {
    pub fn select<'a>(&self, plans: &'a [BatchPlan]) -> &'a [BatchPlan] {
        let from = self.start_batch.saturating_sub(1).min(plans.len());
        let to = match self.num_batches {
            Some(n) => from.saturating_add(n).min(plans.len()),
            None => plans.len(),
        };
        &plans[from..to]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_backoff: settings.retry_backoff(),
        }
    }

    /// Wait before attempt `attempt + 1`, doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Render `url`, retrying capture failures with exponential backoff.
///
/// Returns the capture and the number of attempts used, or the last error
/// once the cap is reached.
pub async fn render_with_retry<R: Renderer + ?Sized>(
    renderer: &R,
    url: &str,
    profile: &InteractionProfile,
    retry: &RetryPolicy,
) -> Result<(PageCapture, u32), (CaptureError, u32)> {
    let mut attempt = 1;
    loop {
        match renderer.navigate(url, profile).await {
            Ok(capture) => return Ok((capture, attempt)),
            Err(e) if attempt >= retry.max_attempts => return Err((e, attempt)),
            Err(e) => {
                let wait = retry.backoff(attempt);
                warn!(
                    url,
                    attempt,
                    "Capture failed: {}, retrying in {}ms",
                    e,
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches_run: usize,
    pub batches_skipped: usize,
    pub batches_aborted: usize,
    pub analyzed: usize,
    pub degenerate: usize,
    pub failed: usize,
    pub reset: usize,
}

impl RunSummary {
    pub fn processed(&self) -> usize {
        self.analyzed + self.degenerate + self.failed
    }
}

/// Drives the universe through render → detect → sink → ledger, one URL at
/// a time.
pub struct BatchController<R: Renderer> {
    renderer: R,
    engine: DetectionEngine,
    snapshot: Arc<TrackerSnapshot>,
    ledger: ProgressLedger,
    sink: ResultSink,
    profile: InteractionProfile,
    retry: RetryPolicy,
}

impl<R: Renderer> BatchController<R> {
    pub fn new(
        renderer: R,
        engine: DetectionEngine,
        snapshot: Arc<TrackerSnapshot>,
        ledger: ProgressLedger,
        sink: ResultSink,
        profile: InteractionProfile,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            renderer,
            engine,
            snapshot,
            ledger,
            sink,
            profile,
            retry,
        }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn ledger(&self) -> &ProgressLedger {
        &self.ledger
    }

    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    /// Process the batches of `window`, resuming whatever the ledger says is
    /// unfinished. A persistence failure aborts only the batch it occurs in.
    pub async fn run(
        &mut self,
        urls: &[UrlEntry],
        batch_size: usize,
        window: BatchWindow,
    ) -> Result<RunSummary> {
        let plans = partition(urls.len(), batch_size);
        self.ledger
            .register(urls, &plans, batch_size)
            .context("Failed to register URLs in the ledger")?;

        let mut summary = RunSummary {
            reset: self.ledger.resume().context("Failed to resume ledger")?,
            ..Default::default()
        };

        let selected = window.select(&plans);
        info!(
            total_batches = plans.len(),
            selected = selected.len(),
            batch_size,
            "Starting run"
        );

        for plan in selected {
            match self.ledger.is_flushed(plan.id) {
                Ok(true) => {
                    info!(batch = plan.id, "Batch already flushed, skipping");
                    summary.batches_skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(batch = plan.id, "Ledger unreadable: {}", e);
                    summary.batches_aborted += 1;
                    continue;
                }
            }

            match self.run_batch(plan, urls, &mut summary).await {
                Ok(()) => summary.batches_run += 1,
                Err(e) => {
                    error!(batch = plan.id, "Batch aborted: {}", e);
                    summary.batches_aborted += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn run_batch(
        &mut self,
        plan: &BatchPlan,
        urls: &[UrlEntry],
        summary: &mut RunSummary,
    ) -> Result<(), PersistenceError> {
        let started = Instant::now();
        let rehydrated = self.ledger.batch_records(plan.id)?;
        let pending = self.ledger.pending_in_batch(plan.id)?;
        info!(
            batch = plan.id,
            urls = plan.len(),
            done = rehydrated.len(),
            pending = pending.len(),
            "Processing batch"
        );
        self.sink.begin(plan.id, rehydrated);

        let pb = ProgressBar::new(pending.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        for idx in pending {
            let Some(entry) = urls.get(idx) else {
                warn!(idx, "Ledger refers to a URL outside the universe");
                continue;
            };
            pb.set_message(entry.url.clone());
            let status = self.process_url(entry).await?;
            match status {
                RecordStatus::Analyzed => summary.analyzed += 1,
                RecordStatus::Degenerate => summary.degenerate += 1,
                RecordStatus::Failed => summary.failed += 1,
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        if self.ledger.batch_complete(plan.id)? {
            let path = self.sink.flush()?;
            self.ledger.mark_flushed(plan.id, &path)?;
            info!(
                batch = plan.id,
                elapsed_s = format!("{:.1}", started.elapsed().as_secs_f64()),
                "Batch complete"
            );
        } else {
            warn!(batch = plan.id, "Batch still has open URLs, not flushing");
        }
        Ok(())
    }

    async fn process_url(&mut self, entry: &UrlEntry) -> Result<RecordStatus, PersistenceError> {
        self.ledger.mark_in_progress(entry.index)?;

        let outcome =
            render_with_retry(&self.renderer, &entry.url, &self.profile, &self.retry).await;
        let (record, attempts) = match outcome {
            Ok((capture, attempts)) => (
                self.engine
                    .analyze(entry, &capture, &self.snapshot, attempts),
                attempts,
            ),
            Err((e, attempts)) => {
                warn!(url = %entry.url, attempts, "Giving up: {}", e);
                (
                    self.engine
                        .failed(entry, &e.to_string(), attempts, &self.snapshot),
                    attempts,
                )
            }
        };

        let status = record.status;
        self.sink.push(entry.index, record.clone());
        match status {
            RecordStatus::Failed => self.ledger.mark_failed(entry.index, &record, attempts)?,
            _ => self.ledger.mark_done(entry.index, &record, attempts)?,
        }
        Ok(status)
    }
}
