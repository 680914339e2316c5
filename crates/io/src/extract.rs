//! Batched extraction with a bounded hand-off to the consumer.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver};
use salesync_config::RetryConfig;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::retry::with_retry;
use crate::source::{BatchSource, ResultBatch};

pub type BatchReceiver = Receiver<Result<Batch>>;

/// One page of the source result set.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Zero-based position in emission order.
    pub index: usize,
    /// Zero-based offset of the first row.
    pub first_row: u64,
    pub data: ResultBatch,
}

impl Batch {
    pub fn last_row(&self) -> u64 {
        self.first_row + (self.data.len() as u64).saturating_sub(1)
    }
}

/// Pages through a source in fixed-size batches, in order.
///
/// Each fetch is retried on transient errors. Iteration ends after a short
/// or empty page, or after the first error.
pub struct Extractor<S> {
    source: S,
    batch_size: usize,
    retry: RetryConfig,
    offset: u64,
    index: usize,
    done: bool,
}

impl<S: BatchSource> Extractor<S> {
    pub fn new(source: S, batch_size: usize, retry: RetryConfig) -> Result<Self> {
        if batch_size == 0 {
            return Err(SyncError::configuration("batch size must be at least 1"));
        }
        Ok(Self {
            source,
            batch_size,
            retry,
            offset: 0,
            index: 0,
            done: false,
        })
    }

    /// Rows emitted so far.
    pub fn rows_read(&self) -> u64 {
        self.offset
    }
}

impl<S: BatchSource> Iterator for Extractor<S> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let (offset, limit) = (self.offset, self.batch_size);
        let source = &mut self.source;
        let fetched = with_retry(&self.retry, "extract batch", || source.fetch(offset, limit));

        let data = match fetched {
            Ok(data) => data,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if data.len() < self.batch_size {
            self.done = true;
        }
        if data.is_empty() {
            return None;
        }

        let batch = Batch {
            index: self.index,
            first_row: self.offset,
            data,
        };
        debug!(
            "Extracted batch {} (rows {}-{})",
            batch.index,
            batch.first_row,
            batch.last_row()
        );
        self.index += 1;
        self.offset += batch.data.len() as u64;
        Some(Ok(batch))
    }
}

/// Run `extractor` on its own thread, handing batches over a channel that
/// holds at most `depth` of them. The producer stops early once the receiver
/// is dropped.
pub fn spawn_producer<S>(
    extractor: Extractor<S>,
    depth: usize,
) -> Result<(BatchReceiver, JoinHandle<()>)>
where
    S: BatchSource + Send + 'static,
{
    let (tx, rx) = bounded(depth.max(1));
    let handle = thread::Builder::new()
        .name("salesync-extract".into())
        .spawn(move || {
            let mut sent = 0usize;
            for item in extractor {
                if tx.send(item).is_err() {
                    debug!("Extraction consumer went away after {} batch(es)", sent);
                    return;
                }
                sent += 1;
            }
            info!("Extraction finished: {} batch(es)", sent);
        })?;
    Ok((rx, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct MemorySource {
        rows: u64,
        fail_first: usize,
        calls: Arc<AtomicUsize>,
    }

    impl MemorySource {
        fn new(rows: u64) -> Self {
            Self {
                rows,
                fail_first: 0,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl BatchSource for MemorySource {
        fn fetch(&mut self, offset: u64, limit: usize) -> Result<ResultBatch> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(SyncError::TransientDb {
                    operation: "fetch".into(),
                    attempts: 1,
                    message: "database is locked".into(),
                });
            }
            let end = (offset + limit as u64).min(self.rows);
            Ok(ResultBatch {
                columns: vec!["n".into()],
                rows: (offset..end).map(|n| vec![Cell::Int(n as i64)]).collect(),
            })
        }
    }

    fn retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            attempts,
            delay_ms: 1,
        }
    }

    #[test]
    fn emits_ceil_batches_in_order() {
        let batches: Vec<Batch> = Extractor::new(MemorySource::new(10), 4, retry(1))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches.iter().map(|b| b.first_row).collect::<Vec<_>>(),
            vec![0, 4, 8]
        );
        assert_eq!(batches[2].data.len(), 2);
        assert_eq!(batches[2].last_row(), 9);
        assert_eq!(batches[1].data.rows[0][0], Cell::Int(4));
    }

    #[test]
    fn exact_multiple_ends_on_empty_page() {
        let source = MemorySource::new(8);
        let calls = source.calls.clone();
        let count = Extractor::new(source, 4, retry(1)).unwrap().count();
        assert_eq!(count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn zero_rows_yield_no_batches() {
        assert_eq!(Extractor::new(MemorySource::new(0), 4, retry(1)).unwrap().count(), 0);
    }

    #[test]
    fn transient_fetch_is_retried() {
        let mut source = MemorySource::new(3);
        source.fail_first = 2;
        let batches: Vec<Batch> = Extractor::new(source, 5, retry(3))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn exhausted_retries_end_iteration_with_error() {
        let mut source = MemorySource::new(3);
        source.fail_first = 10;
        let mut extractor = Extractor::new(source, 5, retry(2)).unwrap();
        let err = extractor.next().unwrap().unwrap_err();
        assert!(matches!(err, SyncError::TransientDb { attempts: 2, .. }));
        assert!(extractor.next().is_none());
    }

    #[test]
    fn producer_hands_over_all_batches() {
        let extractor = Extractor::new(MemorySource::new(25), 10, retry(1)).unwrap();
        let (rx, handle) = spawn_producer(extractor, 1).unwrap();
        let rows: usize = rx.iter().map(|b| b.unwrap().data.len()).sum();
        handle.join().unwrap();
        assert_eq!(rows, 25);
    }

    #[test]
    fn producer_stops_when_receiver_dropped() {
        let extractor = Extractor::new(MemorySource::new(1_000), 1, retry(1)).unwrap();
        let (rx, handle) = spawn_producer(extractor, 1).unwrap();
        let first = rx.recv().unwrap().unwrap();
        assert_eq!(first.index, 0);
        drop(rx);
        handle.join().unwrap();
    }
}
