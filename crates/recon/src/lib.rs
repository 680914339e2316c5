//! `salesync-recon`: Sales line classification and reconciliation engine.
//!
//! Pure engine crate: receives pre-loaded sale lines and an existing-record
//! snapshot, returns classified lines, totals and a go/no-go decision.
//! No database or file IO.

pub mod classify;
pub mod compare;
pub mod config;
pub mod error;
pub mod key;
pub mod model;
pub mod normalize;
pub mod validate;

pub use classify::{BatchClassification, ClassifiedLine, Classifier, ClassifyCounts};
pub use config::{EngineConfig, RouteMap, ToleranceConfig};
pub use error::ReconError;
pub use key::{KeyBuilder, KeyError, KeyField};
pub use model::{
    Bucket, CompositeKey, DateWindow, ExistingRecord, ExistingSnapshot, PerRoute, Route, RouteTotals,
    SaleLine,
};
pub use validate::{decide, Decision, DecisionKind, ReconciliationAccumulator, ReconciliationTotals};
