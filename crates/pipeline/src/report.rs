//! The reporting flow: run each logical table's query into staging, then
//! export everything as one artifact set.

use std::collections::HashSet;
use std::time::Instant;

use salesync_config::SyncConfig;
use salesync_io::{
    spawn_producer, with_retry, ArtifactName, BatchReceiver, ExportOutcome, Exporter, Extractor,
    SqliteSource, StagingArea, SyncError,
};
use salesync_recon::DateWindow;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::error::RunFailure;
use crate::progress::{ProgressSink, ProgressTracker, Stage};
use crate::sync::join_producer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportTable {
    /// Sheet or file suffix.
    pub name: String,
    /// May bind the window as `:start` and `:end`.
    pub query: String,
}

#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub source_id: String,
    pub report_name: String,
    pub requester: Option<String>,
    pub window: DateWindow,
    pub tables: Vec<ReportTable>,
}

pub struct ReportOrchestrator {
    config: SyncConfig,
    exporter: Exporter,
}

impl ReportOrchestrator {
    pub fn new(config: SyncConfig) -> Result<Self, RunFailure> {
        config.validate()?;
        let exporter = Exporter::new(&config.export);
        Ok(Self { config, exporter })
    }

    pub fn run(
        &self,
        request: ReportRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ExportOutcome, RunFailure> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("report_run", run_id = %run_id, report = %request.report_name);
        let _enter = span.enter();

        let started = Instant::now();
        let tracker = ProgressTracker::new(progress);
        match self.execute(&request, &tracker, cancel) {
            Ok(mut outcome) => {
                outcome.execution_time = started.elapsed();
                info!(
                    "Report {} written as {} artifact(s) in {:.1}s",
                    request.report_name,
                    outcome.artifacts.len(),
                    outcome.execution_time.as_secs_f64()
                );
                Ok(outcome)
            }
            Err(e) => {
                error!("Report run failed: {}", e.format_detailed());
                Err(RunFailure::from(e))
            }
        }
    }

    fn validate(&self, request: &ReportRequest) -> Result<(), SyncError> {
        if request.source_id != self.config.source.id {
            return Err(SyncError::configuration(format!(
                "unknown source '{}' (configured: '{}')",
                request.source_id, self.config.source.id
            )));
        }
        if request.report_name.trim().is_empty() {
            return Err(SyncError::configuration("report name is required"));
        }
        if request.tables.is_empty() {
            return Err(SyncError::configuration("report has no tables"));
        }
        let mut seen = HashSet::new();
        for table in &request.tables {
            if table.name.trim().is_empty() {
                return Err(SyncError::configuration("report table name is required"));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(SyncError::configuration(format!(
                    "report table '{}' appears twice",
                    table.name
                )));
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        request: &ReportRequest,
        tracker: &ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExportOutcome, SyncError> {
        self.validate(request)?;
        let mut staging = StagingArea::create(&self.config.staging.dir())?;

        let mut sources = Vec::with_capacity(request.tables.len());
        let mut total_rows = 0u64;
        for table in &request.tables {
            let mut source =
                SqliteSource::new(&self.config.source.path, &table.query, request.window)?
                    .with_busy_timeout(self.config.destination.busy_timeout());
            total_rows += with_retry(&self.config.retry, "count source rows", || {
                source.count_rows()
            })?;
            sources.push(source);
        }
        debug!("Report tables hold {} row(s)", total_rows);
        tracker.update(Stage::Extract, 0, Some(total_rows));

        let mut rows_read = 0u64;
        for (table, source) in request.tables.iter().zip(sources) {
            let extractor =
                Extractor::new(source, self.config.batch.extract_size, self.config.retry)?;
            let (rx, handle) = spawn_producer(extractor, self.config.batch.queue_depth)?;

            let staged = stage_table(
                rx,
                &table.name,
                &mut staging,
                &mut rows_read,
                total_rows,
                tracker,
                cancel,
            );
            join_producer(handle)?;
            staged?;
            debug!("Staged table {} ({} row(s) so far)", table.name, rows_read);
        }

        let name = ArtifactName {
            report: request.report_name.clone(),
            source: request.source_id.clone(),
            start: request.window.start,
            end: request.window.end,
            requester: request.requester.clone(),
        };
        let tables: Vec<String> = request.tables.iter().map(|t| t.name.clone()).collect();
        let outcome = self.exporter.export(&staging, &tables, &name, |done, total| {
            tracker.update(Stage::Export, done, Some(total));
            !cancel.is_cancelled()
        })?;

        if let Err(e) = staging.dispose() {
            warn!("Could not remove staging area: {}", e);
        }
        tracker.finish(rows_read);
        Ok(outcome)
    }
}

fn stage_table(
    rx: BatchReceiver,
    tag: &str,
    staging: &mut StagingArea,
    rows_read: &mut u64,
    total_rows: u64,
    tracker: &ProgressTracker<'_>,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    for item in rx.iter() {
        cancel.check()?;
        let batch = item?;
        if batch.index == 0 {
            staging.set_columns(tag, &batch.data.columns)?;
        }
        staging.put(tag, &batch.data.rows)?;
        *rows_read += batch.data.len() as u64;
        tracker.update(Stage::Extract, *rows_read, Some(total_rows));
    }
    Ok(())
}
