//! Harvest run controller.
//!
//! [`HarvestPipeline`] sequences one run against a browser session:
//! 1. **Setup**: optional navigation, readiness wait, record sink creation
//! 2. **Expansion** (full mode only): scroll until the feed converges
//! 3. **Extraction**: one snapshot pass over every rendered container
//! 4. **Recording**: dedupe and batch records into the [`RecordSink`]
//! 5. **Fetching**: download media, per record in test mode or once at the
//!    end in full mode
//!
//! Only setup faults and a final flush that cannot persist accepted records
//! abort the run. Everything else is counted and logged.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::HarvestConfig;
use crate::harvest::expand::{ExpansionReport, PageExpander};
use crate::harvest::extract::SnapshotExtractor;
use crate::harvest::fetcher::{AssetFetcher, FetchSummary};
use crate::harvest::recorder::{Acceptance, Recorder};
use crate::harvest::traits::{
    AssetSource, AssetStore, ProgressSink, ProgressUpdate, RecordSink, SinkError, TracingProgress,
};
use crate::model::{AssetTask, Cancellation, FeedRecord, RunMode};
use crate::traits::{BrowserSession, SessionError};

// ============================================================================
// Pipeline Types
// ============================================================================

/// Counters and timings for one run.
#[derive(Debug, Clone)]
pub struct HarvestSummary {
    pub mode: RunMode,

    /// Records returned by the extraction pass
    pub records_extracted: usize,

    /// Records looked at after the test-mode cap
    pub records_processed: usize,

    /// Records appended to the sink
    pub records_stored: usize,

    pub duplicates: usize,

    /// Containers whose extraction raised a fault
    pub failures: usize,

    /// Leading failed container ignored on the first pass
    pub suppressed: usize,

    pub assets_queued: usize,
    pub assets: FetchSummary,

    /// `None` in test mode
    pub expansion: Option<ExpansionReport>,

    pub expansion_duration_ms: u64,
    pub extraction_duration_ms: u64,
    pub fetch_duration_ms: u64,
    pub total_duration_ms: u64,

    /// Run stopped early on request
    pub cancelled: bool,
}

impl HarvestSummary {
    fn new(mode: RunMode) -> Self {
        Self {
            mode,
            records_extracted: 0,
            records_processed: 0,
            records_stored: 0,
            duplicates: 0,
            failures: 0,
            suppressed: 0,
            assets_queued: 0,
            assets: FetchSummary::default(),
            expansion: None,
            expansion_duration_ms: 0,
            extraction_duration_ms: 0,
            fetch_duration_ms: 0,
            total_duration_ms: 0,
            cancelled: false,
        }
    }
}

// ============================================================================
// Pipeline Errors
// ============================================================================

/// Faults that abort a run. Records and assets written before the abort
/// remain valid.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    /// Navigation or readiness failed
    #[error("Session setup failed: {0}")]
    Setup(#[from] SessionError),

    /// The record sink could not be created, or the final flush failed
    #[error("Persisting records failed: {0}")]
    Persist(#[from] SinkError),
}

// ============================================================================
// Pipeline Executor
// ============================================================================

/// # Example
///
/// ```ignore
/// let pipeline = HarvestPipeline::new(&config, CsvSink::new(path), source, store)
///     .with_progress(Arc::new(TracingProgress))
///     .with_cancellation(cancel.clone());
///
/// let summary = pipeline.run(&session, RunMode::Full).await?;
/// println!("Stored {} records", summary.records_stored);
/// ```
pub struct HarvestPipeline<S: RecordSink> {
    config: HarvestConfig,
    extractor: SnapshotExtractor,
    expander: PageExpander,
    fetcher: AssetFetcher,
    recorder: Recorder<S>,
    progress: Arc<dyn ProgressSink>,
    cancel: Cancellation,
}

impl<S: RecordSink> HarvestPipeline<S> {
    /// Creates a pipeline that reports through `tracing` and is never
    /// cancelled unless [`with_cancellation`](Self::with_cancellation) is used.
    pub fn new(
        config: &HarvestConfig,
        sink: S,
        source: Arc<dyn AssetSource>,
        store: Arc<dyn AssetStore>,
    ) -> Self {
        Self {
            extractor: SnapshotExtractor::new(config),
            expander: PageExpander::new(config.expansion.clone()),
            fetcher: AssetFetcher::new(source, store, &config.fetch),
            recorder: Recorder::new(sink, config.recorder.batch_size),
            progress: Arc::new(TracingProgress),
            cancel: Cancellation::new(),
            config: config.clone(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes one harvest run.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] if:
    /// - navigation to `feed.url` or the readiness wait fails
    /// - the record sink cannot be created
    /// - the final flush cannot persist the remaining batch
    #[instrument(skip(self, session))]
    pub async fn run<B>(self, session: &B, mode: RunMode) -> Result<HarvestSummary, HarvestError>
    where
        B: BrowserSession + ?Sized,
    {
        let Self {
            config,
            extractor,
            expander,
            fetcher,
            mut recorder,
            progress,
            cancel,
        } = self;

        let start = Instant::now();
        let mut summary = HarvestSummary::new(mode);
        let selector = config.feed.container_selector.as_str();

        // ====================================================================
        // Setup
        // ====================================================================

        progress.status(&format!("Starting {} harvest", mode));
        if let Some(url) = config.feed.url.as_deref() {
            info!(url, "Navigating to feed");
            session.navigate(url).await?;
        }
        session.await_ready(config.run.ready_timeout()).await?;
        recorder.begin()?;

        // ====================================================================
        // Expansion
        // ====================================================================

        if mode == RunMode::Full {
            progress.status("Expanding feed");
            let expansion_start = Instant::now();
            let report = expander.expand(session, selector, &cancel).await;
            summary.expansion_duration_ms = expansion_start.elapsed().as_millis() as u64;
            summary.expansion = Some(report);
        }

        // ====================================================================
        // Extraction
        // ====================================================================

        let mut records = Vec::new();
        if !cancel.is_cancelled() {
            progress.status("Extracting records");
            let extraction_start = Instant::now();
            records = match extractor.extract(session, selector).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "Snapshot request failed, nothing extracted");
                    progress.status(&format!("Extraction failed: {}", e));
                    Vec::new()
                }
            };
            summary.extraction_duration_ms = extraction_start.elapsed().as_millis() as u64;
        }
        summary.records_extracted = records.len();
        suppress_leading_failure(&mut records, &mut summary);

        if mode == RunMode::Test && records.len() > config.run.test_record_limit {
            debug!(
                extracted = records.len(),
                limit = config.run.test_record_limit,
                "Capping test run"
            );
            records.truncate(config.run.test_record_limit);
        }

        // ====================================================================
        // Recording (and per-record fetching in test mode)
        // ====================================================================

        let total = records.len();
        let mut deferred_tasks: Vec<AssetTask> = Vec::new();

        for (position, record) in records.into_iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            summary.records_processed += 1;

            if record.extraction_failed {
                debug!(ordinal = record.ordinal, error = ?record.error, "Container failed");
                summary.failures += 1;
                continue;
            }

            let tasks = AssetTask::for_record(&record, recorder.accepted());
            let acceptance = recorder.accept(record);
            if acceptance == Acceptance::Duplicate {
                summary.duplicates += 1;
                continue;
            }

            match mode {
                RunMode::Test => {
                    if let Err(e) = recorder.flush() {
                        warn!(error = %e, "Flush failed, rows kept for retry");
                    }
                    summary.assets_queued += tasks.len();
                    let fetched = fetcher.fetch_all(tasks, &cancel, |_| {}).await;
                    summary.assets.merge(fetched);
                    publish(progress.as_ref(), &recorder, &summary, position + 1, total);
                }
                RunMode::Full => {
                    summary.assets_queued += tasks.len();
                    deferred_tasks.extend(tasks);
                    if matches!(acceptance, Acceptance::Flushed(_)) {
                        publish(progress.as_ref(), &recorder, &summary, position + 1, total);
                    }
                }
            }
        }

        recorder.flush()?;
        summary.records_stored = recorder.stored();
        publish(progress.as_ref(), &recorder, &summary, total, total);

        // ====================================================================
        // Deferred fetching (full mode)
        // ====================================================================

        if !deferred_tasks.is_empty() && !cancel.is_cancelled() {
            progress.status(&format!("Downloading {} assets", deferred_tasks.len()));
            let fetch_start = Instant::now();
            let records_stored = summary.records_stored;
            let queued = summary.assets_queued;
            let sink = Arc::clone(&progress);

            let fetched = fetcher
                .fetch_all(deferred_tasks, &cancel, |batch| {
                    sink.progress(ProgressUpdate {
                        records: records_stored,
                        assets_queued: queued,
                        assets_downloaded: batch.summary.succeeded,
                        fraction: Some(batch.summary.processed() as f32 / batch.total_tasks as f32),
                    });
                })
                .await;
            summary.assets.merge(fetched);
            summary.fetch_duration_ms = fetch_start.elapsed().as_millis() as u64;
        }

        summary.cancelled |= cancel.is_cancelled();
        summary.total_duration_ms = start.elapsed().as_millis() as u64;

        info!(
            mode = %mode,
            processed = summary.records_processed,
            stored = summary.records_stored,
            duplicates = summary.duplicates,
            failures = summary.failures,
            assets_downloaded = summary.assets.succeeded,
            assets_failed = summary.assets.failed,
            expansion_ms = summary.expansion_duration_ms,
            extraction_ms = summary.extraction_duration_ms,
            fetch_ms = summary.fetch_duration_ms,
            total_ms = summary.total_duration_ms,
            cancelled = summary.cancelled,
            "Harvest completed"
        );
        progress.status(&format!(
            "Harvest completed: {} records, {} assets",
            summary.records_stored, summary.assets.succeeded
        ));

        Ok(summary)
    }
}

/// The first container of the first pass is often a placeholder that
/// always fails; only that exact case is dropped, before any test-mode cap
/// so it never takes a slot.
fn suppress_leading_failure(records: &mut Vec<FeedRecord>, summary: &mut HarvestSummary) {
    if records
        .first()
        .is_some_and(|r| r.extraction_failed && r.ordinal == 0)
    {
        let placeholder = records.remove(0);
        debug!(error = ?placeholder.error, "Ignoring failed leading container");
        summary.suppressed += 1;
    }
}

fn publish<S: RecordSink>(
    progress: &dyn ProgressSink,
    recorder: &Recorder<S>,
    summary: &HarvestSummary,
    done: usize,
    total: usize,
) {
    progress.progress(ProgressUpdate {
        records: recorder.stored(),
        assets_queued: summary.assets_queued,
        assets_downloaded: summary.assets.succeeded,
        fraction: (total > 0).then(|| done as f32 / total as f32),
    });
}

// ============================================================================
// Tests
// ============================================================================
