//! Chunked export of staged result sets to XLSX or CSV artifacts.
//!
//! Small results become one workbook with a sheet per logical table; large
//! ones become one CSV per table. Everything is written to temporary files in
//! the output directory and only moved to the final names once every table
//! has been written, so a failure leaves no artifact behind.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use salesync_config::ExportConfig;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::source::Cell;
use crate::staging::StagingArea;

/// Rows per worksheet, header included.
const XLSX_MAX_ROWS: u64 = 1_048_576;
const SHEET_NAME_MAX: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Xlsx,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Xlsx => "xlsx",
            Self::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportOutcome {
    pub format: ExportFormat,
    pub artifacts: Vec<PathBuf>,
    pub rows_per_table: BTreeMap<String, u64>,
    pub execution_time: Duration,
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Parts of an artifact file name.
#[derive(Debug, Clone)]
pub struct ArtifactName {
    pub report: String,
    pub source: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub requester: Option<String>,
}

impl ArtifactName {
    /// `<report>[_<table>]_<SOURCE>_<start>_<end>[_user_<requester>].<ext>`
    pub fn file_name(&self, table: Option<&str>, format: ExportFormat) -> String {
        let mut name = self.report.clone();
        if let Some(table) = table {
            name.push('_');
            name.push_str(table);
        }
        name.push_str(&format!(
            "_{}_{}_{}",
            self.source.to_uppercase(),
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d")
        ));
        if let Some(user) = self.requester.as_deref().filter(|u| !u.trim().is_empty()) {
            name.push_str("_user_");
            name.push_str(user.trim());
        }
        format!("{}.{}", sanitize_file_name(&name), format.extension())
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn sheet_name(table: &str, used: &mut HashSet<String>) -> String {
    let base: String = table
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
        .take(SHEET_NAME_MAX)
        .collect();
    let base = match base.trim_matches('\'').trim() {
        "" => "Sheet".to_string(),
        b => b.to_string(),
    };
    let mut name = base.clone();
    let mut n = 2;
    while !used.insert(name.to_lowercase()) {
        let suffix = format!("~{n}");
        let keep = SHEET_NAME_MAX.saturating_sub(suffix.len());
        name = format!("{}{}", base.chars().take(keep).collect::<String>(), suffix);
        n += 1;
    }
    name
}

// ---------------------------------------------------------------------------
// Exporter
// ---------------------------------------------------------------------------

pub struct Exporter {
    output_dir: PathBuf,
    csv_threshold: u64,
    chunk_size: usize,
}

impl Exporter {
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            csv_threshold: config.csv_threshold,
            chunk_size: config.chunk_size.max(1),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// CSV once the largest table reaches the threshold or would not fit a
    /// worksheet.
    pub fn choose_format(&self, largest_table: u64) -> ExportFormat {
        if largest_table >= self.csv_threshold || largest_table >= XLSX_MAX_ROWS {
            ExportFormat::Csv
        } else {
            ExportFormat::Xlsx
        }
    }

    /// Write `tables` (staging tags, in sheet/file order) as artifacts.
    ///
    /// `keep_going(rows_done, rows_total)` is called between chunks; returning
    /// `false` abandons the export with `Cancelled`.
    pub fn export<F>(
        &self,
        staging: &StagingArea,
        tables: &[String],
        name: &ArtifactName,
        mut keep_going: F,
    ) -> Result<ExportOutcome>
    where
        F: FnMut(u64, u64) -> bool,
    {
        let started = Instant::now();
        std::fs::create_dir_all(&self.output_dir)?;

        let mut rows_per_table = BTreeMap::new();
        for table in tables {
            rows_per_table.insert(table.clone(), staging.count(table)?);
        }
        let largest = rows_per_table.values().copied().max().unwrap_or(0);
        let total: u64 = rows_per_table.values().sum();
        let format = self.choose_format(largest);
        info!(
            "Exporting {} table(s), {} row(s) as {}",
            tables.len(),
            total,
            format.extension()
        );

        let mut progress = ChunkProgress {
            done: 0,
            total,
            keep_going: &mut keep_going,
        };
        let artifacts = match format {
            ExportFormat::Xlsx => vec![self.write_xlsx(staging, tables, name, &mut progress)?],
            ExportFormat::Csv => self.write_csv(staging, tables, name, &mut progress)?,
        };
        Ok(ExportOutcome {
            format,
            artifacts,
            rows_per_table,
            execution_time: started.elapsed(),
        })
    }

    fn write_xlsx(
        &self,
        staging: &StagingArea,
        tables: &[String],
        name: &ArtifactName,
        progress: &mut ChunkProgress<'_>,
    ) -> Result<PathBuf> {
        let mut workbook = Workbook::new();
        let header = Format::new().set_bold();
        let mut used = HashSet::new();

        for table in tables {
            // Rows are flushed to disk as they are written, strictly in order.
            let worksheet = workbook.add_worksheet_with_constant_memory();
            worksheet.set_name(sheet_name(table, &mut used))?;
            let columns = staging.columns(table)?;
            for (col, title) in columns.iter().enumerate() {
                worksheet.write_string_with_format(0, col_index(col)?, title, &header)?;
            }
            worksheet.set_freeze_panes(1, 0)?;

            let mut row: u32 = 1;
            for chunk in staging.scan::<Vec<Cell>>(table, self.chunk_size) {
                let chunk = chunk?;
                for cells in &chunk {
                    write_xlsx_row(worksheet, row, cells)?;
                    row += 1;
                }
                progress.advance(chunk.len())?;
            }
            debug!("Wrote sheet for {} ({} row(s))", table, row - 1);
        }

        let tmp = NamedTempFile::new_in(&self.output_dir)?;
        workbook.save(tmp.path())?;
        let target = self.output_dir.join(name.file_name(None, ExportFormat::Xlsx));
        tmp.persist(&target).map_err(|e| SyncError::Io(e.error))?;
        info!("Export written to {:?}", target);
        Ok(target)
    }

    fn write_csv(
        &self,
        staging: &StagingArea,
        tables: &[String],
        name: &ArtifactName,
        progress: &mut ChunkProgress<'_>,
    ) -> Result<Vec<PathBuf>> {
        let mut pending = Vec::with_capacity(tables.len());
        for table in tables {
            let tmp = NamedTempFile::new_in(&self.output_dir)?;
            let mut writer = csv::Writer::from_writer(tmp.reopen()?);
            let columns = staging.columns(table)?;
            if !columns.is_empty() {
                writer.write_record(&columns)?;
            }
            for chunk in staging.scan::<Vec<Cell>>(table, self.chunk_size) {
                let chunk = chunk?;
                for cells in &chunk {
                    writer.write_record(
                        cells
                            .iter()
                            .map(|c| c.as_text().unwrap_or_default().into_owned()),
                    )?;
                }
                progress.advance(chunk.len())?;
            }
            writer.flush()?;
            let target = self
                .output_dir
                .join(name.file_name(Some(table), ExportFormat::Csv));
            pending.push((tmp, target));
        }

        let mut artifacts = Vec::with_capacity(pending.len());
        for (tmp, target) in pending {
            if let Err(e) = tmp.persist(&target) {
                remove_artifacts(&artifacts);
                return Err(SyncError::Io(e.error));
            }
            info!("Export written to {:?}", target);
            artifacts.push(target);
        }
        Ok(artifacts)
    }
}

/// Undo the renames of an artifact set that could not be completed.
fn remove_artifacts(persisted: &[PathBuf]) {
    for path in persisted {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Could not remove incomplete artifact {:?}: {}", path, e);
        }
    }
}

struct ChunkProgress<'a> {
    done: u64,
    total: u64,
    keep_going: &'a mut dyn FnMut(u64, u64) -> bool,
}

impl ChunkProgress<'_> {
    fn advance(&mut self, rows: usize) -> Result<()> {
        self.done += rows as u64;
        if (self.keep_going)(self.done, self.total) {
            Ok(())
        } else {
            Err(SyncError::Cancelled)
        }
    }
}

fn col_index(col: usize) -> Result<u16> {
    u16::try_from(col).map_err(|_| SyncError::export(format!("column {col} exceeds sheet width")))
}

fn write_xlsx_row(worksheet: &mut Worksheet, row: u32, cells: &[Cell]) -> Result<()> {
    for (col, cell) in cells.iter().enumerate() {
        let col = col_index(col)?;
        match cell {
            Cell::Null => {}
            Cell::Int(i) => {
                worksheet.write_number(row, col, *i as f64)?;
            }
            Cell::Real(f) if f.is_finite() => {
                worksheet.write_number(row, col, *f)?;
            }
            Cell::Real(f) => {
                worksheet.write_string(row, col, f.to_string())?;
            }
            Cell::Text(s) => {
                worksheet.write_string(row, col, s)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
