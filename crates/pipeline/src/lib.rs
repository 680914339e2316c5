//! `salesync-pipeline`: Run orchestration.
//!
//! Wires the engine and the IO stages into the two flows callers invoke:
//! the sync run (snapshot, classify, reconcile, audit, mutate) and the
//! reporting run (extract to staging, export). Both report progress through
//! a caller-supplied sink and stop at batch boundaries when cancelled.

pub mod cancel;
pub mod error;
pub mod logging;
pub mod progress;
pub mod report;
pub mod sync;

pub use cancel::CancellationToken;
pub use error::RunFailure;
pub use progress::{NoProgress, ProgressEvent, ProgressSink, ProgressTracker, Stage};
pub use report::{ReportOrchestrator, ReportRequest, ReportTable};
pub use sync::{RunRequest, RunResult, SyncOrchestrator};
