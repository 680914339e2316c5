//! Batched, transactional writes of NEW and UPDATE lines.

use std::collections::BTreeMap;

use chrono::{Datelike, Utc};
use rusqlite::{params, Transaction};
use salesync_config::RetryConfig;
use salesync_recon::{Bucket, ClassifiedLine};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::partition::{PartitionResolver, PartitionTable};
use crate::pool::DestinationPool;
use crate::retry::with_retry;
use crate::schema::ensure_partition;

/// Cumulative write counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MutationReport {
    pub inserted: u64,
    /// NEW lines whose key already existed; left untouched.
    pub ignored: u64,
    pub updated: u64,
    /// UPDATE lines whose row was gone by the time of the write.
    pub update_missed: u64,
    pub batches_applied: usize,
}

impl MutationReport {
    pub fn rows_written(&self) -> u64 {
        self.inserted + self.ignored + self.updated + self.update_missed
    }

    fn merge(&mut self, other: &MutationReport) {
        self.inserted += other.inserted;
        self.ignored += other.ignored;
        self.updated += other.updated;
        self.update_missed += other.update_missed;
    }
}

pub struct Mutator {
    pool: DestinationPool,
    resolver: PartitionResolver,
    retry: RetryConfig,
}

impl Mutator {
    pub fn new(pool: DestinationPool, resolver: PartitionResolver, retry: RetryConfig) -> Self {
        Self {
            pool,
            resolver,
            retry,
        }
    }

    /// Write one batch in a single transaction, retrying the whole batch on
    /// transient errors. PRESERVE lines are skipped.
    pub fn apply_batch(&self, lines: &[ClassifiedLine]) -> Result<MutationReport> {
        let mut by_table: BTreeMap<PartitionTable, Vec<&ClassifiedLine>> = BTreeMap::new();
        for line in lines.iter().filter(|l| Bucket::WRITTEN.contains(&l.bucket)) {
            let table = self.resolver.resolve(line.route, line.target_date().year())?;
            by_table.entry(table).or_default().push(line);
        }
        if by_table.is_empty() {
            return Ok(MutationReport::default());
        }

        with_retry(&self.retry, "apply mutation batch", || {
            let mut conn = self.pool.get()?;
            let tx = conn
                .transaction()
                .map_err(|e| SyncError::from_sqlite("begin mutation", e))?;
            let mut report = MutationReport::default();
            for (table, lines) in &by_table {
                ensure_partition(&tx, table)?;
                write_table(&tx, table, lines, &mut report)?;
            }
            tx.commit()
                .map_err(|e| SyncError::from_sqlite("commit mutation", e))?;
            Ok(report)
        })
    }

    /// Apply batches in order until the input is exhausted.
    ///
    /// `keep_going` sees the cumulative report before every batch; returning
    /// `false` stops with `Cancelled`. A batch that cannot be applied stops
    /// with `PartialBatch`; every earlier batch stays committed.
    pub fn apply_all<I, F>(&self, batches: I, mut keep_going: F) -> Result<MutationReport>
    where
        I: IntoIterator<Item = Result<Vec<ClassifiedLine>>>,
        F: FnMut(&MutationReport) -> bool,
    {
        let mut total = MutationReport::default();
        let mut next_row = 0u64;

        for (batch_index, batch) in batches.into_iter().enumerate() {
            if !keep_going(&total) {
                info!(
                    "Mutation cancelled after {} batch(es)",
                    total.batches_applied
                );
                return Err(SyncError::Cancelled);
            }
            let lines = batch?;
            let first_row = next_row;
            let last_row = first_row + (lines.len() as u64).saturating_sub(1);

            match self.apply_batch(&lines) {
                Ok(report) => {
                    total.merge(&report);
                    total.batches_applied += 1;
                    next_row += lines.len() as u64;
                    debug!(
                        "Applied batch {} (rows {}-{}): {} inserted, {} updated",
                        batch_index, first_row, last_row, report.inserted, report.updated
                    );
                }
                Err(e) => {
                    warn!(
                        "Mutation batch {} (rows {}-{}) failed: {}",
                        batch_index, first_row, last_row, e
                    );
                    return Err(SyncError::PartialBatch {
                        batch_index,
                        first_row,
                        last_row,
                        batches_applied: total.batches_applied,
                        message: e.to_string(),
                    });
                }
            }
        }
        keep_going(&total);

        if total.ignored > 0 || total.update_missed > 0 {
            warn!(
                "{} insert(s) hit an existing key and {} update(s) found no row",
                total.ignored, total.update_missed
            );
        }
        Ok(total)
    }
}

fn write_table(
    tx: &Transaction<'_>,
    table: &PartitionTable,
    lines: &[&ClassifiedLine],
    report: &mut MutationReport,
) -> Result<()> {
    let map = |e| SyncError::from_sqlite("write destination rows", e);
    let now = Utc::now().to_rfc3339();

    let mut insert = tx
        .prepare(&format!(
            "INSERT OR IGNORE INTO {}
             (client_code, agent_code, product_code, document_number, line_type, line_seq,
              sale_date, quantity, net_amount, cost, descriptive, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            table.quoted()
        ))
        .map_err(map)?;
    let mut update = tx
        .prepare(&format!(
            "UPDATE {}
             SET sale_date = ?7, quantity = ?8, net_amount = ?9, cost = ?10,
                 descriptive = ?11, updated_at = ?12
             WHERE client_code = ?1 AND agent_code = ?2 AND product_code = ?3
               AND document_number = ?4 AND line_type = ?5 AND line_seq = ?6",
            table.quoted()
        ))
        .map_err(map)?;

    for line in lines {
        let descriptive = serde_json::to_string(&line.line.descriptive)
            .map_err(|e| SyncError::Database {
                operation: "encode descriptive fields".into(),
                message: e.to_string(),
            })?;
        let sale_date = line.line.sale_date.to_string();
        let k = &line.key;
        let values = params![
            k.client,
            k.agent,
            k.product,
            k.document,
            k.line_type,
            k.line_seq,
            sale_date,
            line.line.quantity,
            line.line.net_amount,
            line.line.cost,
            descriptive,
            now,
        ];
        match line.bucket {
            Bucket::New => match insert.execute(values).map_err(map)? {
                0 => report.ignored += 1,
                _ => report.inserted += 1,
            },
            Bucket::Update => match update.execute(values).map_err(map)? {
                0 => report.update_missed += 1,
                _ => report.updated += 1,
            },
            Bucket::Preserve => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
