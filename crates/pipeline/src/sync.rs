//! The sync flow: snapshot, extract and classify, reconcile, audit, mutate.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use salesync_config::SyncConfig;
use salesync_io::audit::{self, AuditRecord};
use salesync_io::{
    fetch_snapshot, spawn_producer, with_retry, Batch, BatchReceiver, DestinationPool, Extractor,
    LineMapper, MutationReport, Mutator, PartitionResolver, SqliteSource, StagingArea, SyncError,
};
use salesync_recon::{
    decide, Bucket, ClassifiedLine, Classifier, ClassifyCounts, DateWindow, Decision,
    DecisionKind, ExistingSnapshot, KeyBuilder, ReconciliationAccumulator,
};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::error::RunFailure;
use crate::progress::{ProgressSink, ProgressTracker, Stage};

/// Staging tag holding one classified line per key for the whole run.
const LINES_TAG: &str = "lines";

/// One sync invocation. Unset fields fall back to the configuration.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub window_start: Option<NaiveDate>,
    pub window_end: Option<NaiveDate>,
    pub batch_size: Option<usize>,
    pub tolerance: Option<f64>,
}

impl RunRequest {
    pub fn for_window(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            window_start: Some(start),
            window_end: Some(end),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    /// False when the run was blocked by reconciliation or failed.
    pub success: bool,
    pub new_count: u64,
    pub updated_count: u64,
    pub preserved_count: u64,
    /// Duplicate key groups found by reconciliation.
    pub duplicate_count: u64,
    pub counts: ClassifyCounts,
    pub mutation: Option<MutationReport>,
    pub warnings: Vec<String>,
    pub execution_time: Duration,
    pub decision: Option<Decision>,
    pub error: Option<RunFailure>,
}

#[derive(Debug, Default)]
struct RunState {
    counts: ClassifyCounts,
    /// Keyed lines handed to staging, before the run-wide collapse.
    lines_staged: u64,
    rejected_dates: u64,
    repaired_fields: u64,
    existing_skipped: u64,
    earliest_sale: Option<NaiveDate>,
    decision: Option<Decision>,
    mutation: Option<MutationReport>,
}

impl RunState {
    fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let c = &self.counts;
        if c.discarded_no_key > 0 {
            warnings.push(format!(
                "{} line(s) discarded: incomplete composite key",
                c.discarded_no_key
            ));
        }
        if c.discarded_unrouted > 0 {
            warnings.push(format!(
                "{} line(s) discarded: line type maps to no route",
                c.discarded_unrouted
            ));
        }
        if self.rejected_dates > 0 {
            warnings.push(format!(
                "{} row(s) rejected: missing or unreadable sale date",
                self.rejected_dates
            ));
        }
        if c.duplicates_collapsed > 0 {
            warnings.push(format!(
                "{} duplicate staged line(s) collapsed onto the largest net amount",
                c.duplicates_collapsed
            ));
        }
        if self.existing_skipped > 0 {
            warnings.push(format!(
                "{} destination row(s) have an incomplete key and were not matched",
                self.existing_skipped
            ));
        }
        if let Some(decision) = &self.decision {
            if decision.kind != DecisionKind::ContinueNormal {
                warnings.push(format!("{}: {}", decision.kind, decision.message));
            }
        }
        if let Some(m) = &self.mutation {
            if m.ignored > 0 {
                warnings.push(format!("{} insert(s) found the key already present", m.ignored));
            }
            if m.update_missed > 0 {
                warnings.push(format!("{} update(s) found no row to change", m.update_missed));
            }
        }
        warnings
    }
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    pool: DestinationPool,
    resolver: PartitionResolver,
}

impl SyncOrchestrator {
    /// Validates the configuration; no IO happens here.
    pub fn new(config: SyncConfig, pool: DestinationPool) -> Result<Self, RunFailure> {
        config.validate()?;
        let resolver =
            PartitionResolver::new(&config.destination.table_prefix, config.destination.years)?;
        Ok(Self {
            config,
            pool,
            resolver,
        })
    }

    pub fn run(
        &self,
        request: RunRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> RunResult {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("sync_run", run_id = %run_id, source = %self.config.source.id);
        let _enter = span.enter();

        let started = Instant::now();
        let tracker = ProgressTracker::new(progress);
        let mut state = RunState::default();
        let outcome = self.execute(&request, &tracker, cancel, &mut state);
        let execution_time = started.elapsed();

        let (success, failure) = match outcome {
            Ok(mutated) => {
                info!(
                    "Sync run finished in {:.1}s: {} new, {} updated, {} preserved",
                    execution_time.as_secs_f64(),
                    state.counts.new,
                    state.counts.update,
                    state.counts.preserve
                );
                (mutated, None)
            }
            Err(e) => {
                error!("Sync run failed: {}", e.format_detailed());
                (false, Some(RunFailure::from(e)))
            }
        };

        RunResult {
            run_id,
            success,
            new_count: state.counts.new,
            updated_count: state.counts.update,
            preserved_count: state.counts.preserve,
            duplicate_count: state.decision.as_ref().map_or(0, |d| d.duplicate_groups),
            counts: state.counts,
            warnings: state.warnings(),
            mutation: state.mutation,
            execution_time,
            decision: state.decision,
            error: failure,
        }
    }

    fn window(&self, request: &RunRequest) -> Result<DateWindow, SyncError> {
        let fallback = self.config.window;
        let start = request.window_start.or(fallback.map(|w| w.start));
        let end = request.window_end.or(fallback.map(|w| w.end));
        let (Some(start), Some(end)) = (start, end) else {
            return Err(SyncError::configuration(
                "no sync window: set window_start/window_end or [window] in the config",
            ));
        };
        DateWindow::new(start, end).ok_or_else(|| {
            SyncError::configuration(format!("window start {start} is after end {end}"))
        })
    }

    /// `Ok(true)` when changes were applied, `Ok(false)` when reconciliation
    /// blocked the run.
    fn execute(
        &self,
        request: &RunRequest,
        tracker: &ProgressTracker<'_>,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<bool, SyncError> {
        let window = self.window(request)?;
        let batch_size = request.batch_size.unwrap_or(self.config.batch.extract_size);
        if batch_size == 0 {
            return Err(SyncError::configuration("batch size must be at least 1"));
        }
        let tolerance = request
            .tolerance
            .unwrap_or(self.config.engine.tolerance.reconciliation);
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(SyncError::configuration(format!(
                "reconciliation tolerance must be a non-negative number, got {tolerance}"
            )));
        }
        info!("Sync window {} (batch size {}, tolerance {:.2})", window, batch_size, tolerance);
        let keys = KeyBuilder::new(self.config.engine.include_line_seq);

        // Whole-window snapshot, fetched before the first batch is classified.
        tracker.update(Stage::Snapshot, 0, None);
        let snapshot = with_retry(&self.config.retry, "read existing rows", || {
            let conn = self.pool.get()?;
            fetch_snapshot(&conn, &self.resolver, &window, &keys)
        })?;
        state.existing_skipped = snapshot.skipped;
        info!(
            "Existing snapshot: {} keyed row(s) ({} confirmed, {} returns)",
            snapshot.len(),
            snapshot.totals.confirmed.record_count,
            snapshot.totals.returns.record_count
        );
        cancel.check()?;

        let mut staging = StagingArea::create(&self.config.staging.dir())?;
        let mut source =
            SqliteSource::new(&self.config.source.path, &self.config.source.query, window)?
                .with_busy_timeout(self.config.destination.busy_timeout());
        let source_rows = with_retry(&self.config.retry, "count source rows", || {
            source.count_rows()
        })?;
        info!("Source window holds {} row(s)", source_rows);
        tracker.update(Stage::Extract, 0, Some(source_rows));
        let extractor = Extractor::new(source, batch_size, self.config.retry)?;
        let (rx, handle) = spawn_producer(extractor, self.config.batch.queue_depth)?;

        let staged = self.stage_batches(
            rx,
            &snapshot,
            keys,
            source_rows,
            &mut staging,
            tracker,
            cancel,
            state,
        );
        join_producer(handle)?;
        let accumulator = staged?;
        self.settle(&staging, state)?;

        // Reconcile before any write.
        tracker.update(Stage::Reconcile, 0, None);
        let (totals, groups) = accumulator.finish(snapshot.totals.clone());
        let decision = decide(
            totals,
            groups,
            tolerance,
            self.config.engine.duplicate_warning_limit,
        );
        info!("Reconciliation {}: {}", decision.kind, decision.message);

        let record = AuditRecord::from_decision(
            &decision,
            state.earliest_sale.unwrap_or(window.start),
            Utc::now(),
        );
        with_retry(&self.config.retry, "write audit record", || {
            let conn = self.pool.get()?;
            audit::record(&conn, &self.config.destination.audit_table, &record)
        })?;

        let proceeds = decision.proceeds();
        state.decision = Some(decision);
        if !proceeds {
            warn!("Run blocked before mutation; destination left unchanged");
            tracker.finish(0);
            return Ok(false);
        }
        cancel.check()?;

        // Mutate.
        let pending = state.counts.new + state.counts.update;
        let mutator = Mutator::new(
            self.pool.clone(),
            self.resolver.clone(),
            self.config.retry,
        );
        let writes = staging
            .scan::<ClassifiedLine>(LINES_TAG, self.config.batch.mutate_size)
            .map(|page| {
                page.map(|lines| {
                    lines
                        .into_iter()
                        .filter(|l| l.bucket != Bucket::Preserve)
                        .collect::<Vec<_>>()
                })
            })
            .filter(|page| !matches!(page, Ok(lines) if lines.is_empty()));
        let report = mutator.apply_all(
            writes,
            |so_far| {
                tracker.update(Stage::Mutate, so_far.rows_written(), Some(pending));
                !cancel.is_cancelled()
            },
        )?;
        info!(
            "Applied {} batch(es): {} inserted, {} updated, {} ignored",
            report.batches_applied, report.inserted, report.updated, report.ignored
        );
        state.mutation = Some(report);

        if let Err(e) = staging.dispose() {
            warn!("Could not remove staging area: {}", e);
        }
        tracker.finish(report.rows_written());
        Ok(true)
    }

    /// Consume extracted batches: map, classify, fold into the reconciliation
    /// totals and stage one line per key for the whole run.
    #[allow(clippy::too_many_arguments)]
    fn stage_batches(
        &self,
        rx: BatchReceiver,
        snapshot: &ExistingSnapshot,
        keys: KeyBuilder,
        source_rows: u64,
        staging: &mut StagingArea,
        tracker: &ProgressTracker<'_>,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<ReconciliationAccumulator, SyncError> {
        let classifier = Classifier::new(snapshot, keys, self.config.engine.tolerance.field_epsilon);
        let mut accumulator = ReconciliationAccumulator::new();
        let mut rows_read = 0u64;

        for item in rx.iter() {
            cancel.check()?;
            let batch: Batch = item?;
            let mapper = LineMapper::new(
                &self.config.columns,
                &self.config.engine.routes,
                &batch.data.columns,
            )?;
            let mapped = mapper.map_batch(&batch.data);
            state.rejected_dates += mapped.rejected;
            state.repaired_fields += mapped.repaired;
            if let Some(earliest) = mapped.lines.iter().map(|l| l.sale_date).min() {
                state.earliest_sale = Some(state.earliest_sale.map_or(earliest, |e| e.min(earliest)));
            }

            let classified = classifier.classify_batch(mapped.lines);
            accumulator.absorb(&classified);
            // Buckets are counted once the run-wide collapse has settled.
            let c = &classified.counts;
            state.counts.duplicates_collapsed += c.duplicates_collapsed;
            state.counts.discarded_no_key += c.discarded_no_key;
            state.counts.discarded_unrouted += c.discarded_unrouted;

            let kept = classified.lines.len();
            state.lines_staged += staging.put_keyed(
                LINES_TAG,
                classified.lines.into_iter().map(|l| {
                    let weight = l.line.net_amount.abs();
                    ((l.route, l.key.clone()), weight, l)
                }),
            )? as u64;

            rows_read += batch.data.len() as u64;
            debug!(
                "Batch {}: {} row(s), {} keyed line(s) staged",
                batch.index,
                batch.data.len(),
                kept
            );
            tracker.update(Stage::Extract, rows_read, Some(source_rows));
        }

        if state.repaired_fields > 0 {
            debug!("Repaired {} legacy-encoded field(s)", state.repaired_fields);
        }
        info!("Extracted {} row(s), {} keyed line(s) staged", rows_read, state.lines_staged);
        Ok(accumulator)
    }

    /// Count the lines kept after the run-wide collapse.
    fn settle(&self, staging: &StagingArea, state: &mut RunState) -> Result<(), SyncError> {
        let kept = staging.count(LINES_TAG)?;
        state.counts.duplicates_collapsed += state.lines_staged.saturating_sub(kept);

        for page in staging.scan::<ClassifiedLine>(LINES_TAG, self.config.batch.mutate_size) {
            for line in &page? {
                state.counts.record(line);
            }
        }

        info!(
            "Classified {} line(s): {} new, {} update, {} preserve ({} cost only)",
            kept,
            state.counts.new,
            state.counts.update,
            state.counts.preserve,
            state.counts.cost_preserved
        );
        Ok(())
    }
}

pub(crate) fn join_producer(handle: JoinHandle<()>) -> Result<(), SyncError> {
    handle
        .join()
        .map_err(|_| SyncError::Io(std::io::Error::other("extraction thread panicked")))
}
