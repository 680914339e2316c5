use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Destination partition a sale line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Confirmed sales ("fact" partition).
    Confirmed,
    /// Returns ("dev" partition).
    Returns,
}

impl Route {
    pub const ALL: [Route; 2] = [Route::Confirmed, Route::Returns];

    /// Suffix of the partition tables holding this route.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Confirmed => "fact",
            Self::Returns => "dev",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed => write!(f, "confirmed"),
            Self::Returns => write!(f, "returns"),
        }
    }
}

/// One value per route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerRoute<T> {
    pub confirmed: T,
    pub returns: T,
}

impl<T> PerRoute<T> {
    pub fn get(&self, route: Route) -> &T {
        match route {
            Route::Confirmed => &self.confirmed,
            Route::Returns => &self.returns,
        }
    }

    pub fn get_mut(&mut self, route: Route) -> &mut T {
        match route {
            Route::Confirmed => &mut self.confirmed,
            Route::Returns => &mut self.returns,
        }
    }
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// Inclusive date range compared in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// `None` when `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Calendar years the window touches, ascending.
    pub fn years(&self) -> std::ops::RangeInclusive<i32> {
        self.start.year()..=self.end.year()
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// A single extracted sale line, already mapped from source columns.
///
/// Key fields stay raw (`None` when the source cell was null); the key
/// builder normalizes them. `route` is `None` when the line type maps to no
/// destination partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLine {
    pub client: Option<String>,
    pub agent: Option<String>,
    pub product: Option<String>,
    pub document: Option<String>,
    pub line_type: Option<String>,
    #[serde(default)]
    pub line_seq: Option<String>,
    pub sale_date: NaiveDate,
    pub quantity: f64,
    pub net_amount: f64,
    pub cost: f64,
    pub route: Option<Route>,
    #[serde(default)]
    pub descriptive: BTreeMap<String, String>,
}

/// Canonical identity of a sale line. Fields are normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub client: String,
    pub agent: String,
    pub product: String,
    pub document: String,
    pub line_type: String,
    /// Empty when line sequence is not part of the key or absent.
    pub line_seq: String,
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.client, self.agent, self.product, self.document, self.line_type
        )?;
        if !self.line_seq.is_empty() {
            write!(f, "|{}", self.line_seq)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Existing destination data
// ---------------------------------------------------------------------------

/// Point-in-time mirror of a persisted row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExistingRecord {
    pub quantity: f64,
    pub net_amount: f64,
    pub cost: f64,
    /// Sale date of the persisted row; selects the partition an update targets.
    pub sale_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTotals {
    pub record_count: u64,
    pub sum_net_amount: f64,
}

impl RouteTotals {
    pub fn add(&mut self, net_amount: f64) {
        self.record_count += 1;
        self.sum_net_amount += net_amount;
    }

    pub fn merge(&mut self, other: &RouteTotals) {
        self.record_count += other.record_count;
        self.sum_net_amount += other.sum_net_amount;
    }
}

/// Everything the destination holds for one window, fetched once per run.
#[derive(Debug, Clone, Default)]
pub struct ExistingSnapshot {
    pub records: PerRoute<HashMap<CompositeKey, ExistingRecord>>,
    /// Totals over every row in the window, including rows skipped below.
    pub totals: PerRoute<RouteTotals>,
    /// Destination rows whose key could not be built.
    pub skipped: u64,
}

impl ExistingSnapshot {
    pub fn get(&self, route: Route, key: &CompositeKey) -> Option<&ExistingRecord> {
        self.records.get(route).get(key)
    }

    pub fn insert(&mut self, route: Route, key: CompositeKey, record: ExistingRecord) {
        self.records.get_mut(route).insert(key, record);
    }

    pub fn len(&self) -> usize {
        self.records.confirmed.len() + self.records.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    New,
    Update,
    Preserve,
}

impl Bucket {
    /// Buckets that reach the mutator.
    pub const WRITTEN: [Bucket; 2] = [Bucket::New, Bucket::Update];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Update => "update",
            Self::Preserve => "preserve",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
