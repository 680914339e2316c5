//! Progress reporting boundary.
//!
//! Stages own fixed slices of the 0..=100 range; within a stage the percent
//! follows `processed / total` when the total is known and stays at the
//! stage start otherwise. `ProgressTracker` never lets the reported percent
//! go backwards.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Snapshot,
    Extract,
    Reconcile,
    Mutate,
    Export,
    Done,
}

impl Stage {
    /// Percent range covered by the stage.
    fn span(&self) -> (u8, u8) {
        match self {
            Stage::Snapshot => (0, 5),
            Stage::Extract => (5, 50),
            Stage::Reconcile => (50, 55),
            Stage::Mutate => (55, 99),
            Stage::Export => (50, 99),
            Stage::Done => (100, 100),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Snapshot => "snapshot",
            Stage::Extract => "extract",
            Stage::Reconcile => "reconcile",
            Stage::Mutate => "mutate",
            Stage::Export => "export",
            Stage::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub percent: u8,
    pub processed: u64,
    /// `None` while the total is unknown.
    pub total: Option<u64>,
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(&event)
    }
}

/// Sink that drops every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Computes percents and forwards them to a sink, clamping regressions.
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    last: Mutex<u8>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            last: Mutex::new(0),
        }
    }

    pub fn update(&self, stage: Stage, processed: u64, total: Option<u64>) {
        let (start, end) = stage.span();
        let within = match total {
            Some(0) => end,
            Some(total) => {
                let fraction = (processed.min(total) as f64) / (total as f64);
                start + ((end - start) as f64 * fraction).floor() as u8
            }
            None => start,
        };

        let percent = {
            let mut last = self.last.lock();
            *last = (*last).max(within);
            *last
        };
        self.sink.report(ProgressEvent {
            stage,
            percent,
            processed,
            total,
        });
    }

    pub fn finish(&self, processed: u64) {
        self.update(Stage::Done, processed, Some(processed));
    }

    pub fn percent(&self) -> u8 {
        *self.last.lock()
    }
}
