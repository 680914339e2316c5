//! Pre-sync reconciliation: staging vs. existing totals, duplicate key
//! groups, and the decision that gates mutation.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classify::BatchClassification;
use crate::model::{CompositeKey, PerRoute, Route, RouteTotals};

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationTotals {
    pub staging: PerRoute<RouteTotals>,
    pub existing: PerRoute<RouteTotals>,
}

impl ReconciliationTotals {
    /// Signed `staging - existing` for one route.
    pub fn difference(&self, route: Route) -> f64 {
        self.staging.get(route).sum_net_amount - self.existing.get(route).sum_net_amount
    }

    /// Sum of the per-route differences.
    pub fn total_difference(&self) -> f64 {
        Route::ALL.iter().map(|r| self.difference(*r)).sum()
    }

    pub fn staging_total(&self) -> RouteTotals {
        let mut total = self.staging.confirmed;
        total.merge(&self.staging.returns);
        total
    }

    pub fn existing_total(&self) -> RouteTotals {
        let mut total = self.existing.confirmed;
        total.merge(&self.existing.returns);
        total
    }
}

/// Streams staging totals and matched keys out of classified batches.
#[derive(Debug, Default)]
pub struct ReconciliationAccumulator {
    staging: PerRoute<RouteTotals>,
    duplicate_keys: HashSet<CompositeKey>,
}

impl ReconciliationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one classified batch. A key already persisted in its route
    /// counts as one duplicate group no matter how many staged lines share
    /// it, or how many batches it shows up in.
    pub fn absorb(&mut self, batch: &BatchClassification) {
        for route in Route::ALL {
            self.staging.get_mut(route).merge(batch.staging_totals.get(route));
        }
        for line in batch.lines.iter().filter(|l| l.existing.is_some()) {
            self.duplicate_keys.insert(line.key.clone());
        }
    }

    pub fn duplicate_groups(&self) -> u64 {
        self.duplicate_keys.len() as u64
    }

    pub fn staging(&self) -> &PerRoute<RouteTotals> {
        &self.staging
    }

    /// Pair the streamed staging totals with the destination totals.
    pub fn finish(self, existing: PerRoute<RouteTotals>) -> (ReconciliationTotals, u64) {
        let groups = self.duplicate_groups();
        (
            ReconciliationTotals {
                staging: self.staging,
                existing,
            },
            groups,
        )
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    ContinueNormal,
    ContinueWithWarning,
    ContinuePreexistingDuplicates,
    BlockedReviewRequired,
}

impl DecisionKind {
    /// Whether the run may go on to mutation.
    pub fn proceeds(&self) -> bool {
        !matches!(self, Self::BlockedReviewRequired)
    }

    /// Audit status column.
    pub fn status(&self) -> &'static str {
        if self.proceeds() {
            "OK"
        } else {
            "ERROR"
        }
    }

    pub fn action_taken(&self) -> &'static str {
        match self {
            Self::ContinueNormal => "sync",
            Self::ContinueWithWarning => "sync_with_warning",
            Self::ContinuePreexistingDuplicates => "sync_period_reload",
            Self::BlockedReviewRequired => "blocked",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContinueNormal => write!(f, "CONTINUE_NORMAL"),
            Self::ContinueWithWarning => write!(f, "CONTINUE_WITH_WARNING"),
            Self::ContinuePreexistingDuplicates => write!(f, "CONTINUE_PREEXISTING_DUPLICATES"),
            Self::BlockedReviewRequired => write!(f, "BLOCKED_REVIEW_REQUIRED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub totals: ReconciliationTotals,
    pub duplicate_groups: u64,
    pub tolerance: f64,
    pub message: String,
}

impl Decision {
    pub fn proceeds(&self) -> bool {
        self.kind.proceeds()
    }
}

/// Route the run on the monetary difference first, duplicate groups second.
///
/// Only `|Σstaging − Σexisting| > tolerance` blocks. Duplicate groups never
/// block; they only grade how the go-ahead is reported.
pub fn decide(
    totals: ReconciliationTotals,
    duplicate_groups: u64,
    tolerance: f64,
    duplicate_warning_limit: u64,
) -> Decision {
    let difference = totals.total_difference();
    let within = difference.abs() <= tolerance;

    let kind = if !within {
        DecisionKind::BlockedReviewRequired
    } else if duplicate_groups == 0 {
        DecisionKind::ContinueNormal
    } else if duplicate_groups <= duplicate_warning_limit {
        DecisionKind::ContinueWithWarning
    } else {
        DecisionKind::ContinuePreexistingDuplicates
    };

    let staging = totals.staging_total();
    let existing = totals.existing_total();
    let detail = format!(
        "staging {} rows / {:.2}, existing {} rows / {:.2}, difference {:.2} (confirmed {:.2}, returns {:.2}), tolerance {:.2}",
        staging.record_count,
        staging.sum_net_amount,
        existing.record_count,
        existing.sum_net_amount,
        difference,
        totals.difference(Route::Confirmed),
        totals.difference(Route::Returns),
        tolerance,
    );
    let message = match kind {
        DecisionKind::ContinueNormal => format!("no duplicates, difference acceptable; {detail}"),
        DecisionKind::ContinueWithWarning => format!(
            "{duplicate_groups} key groups already loaded (expected on update); {detail}"
        ),
        DecisionKind::ContinuePreexistingDuplicates => format!(
            "{duplicate_groups} key groups already loaded (full period reload), totals match; {detail}"
        ),
        DecisionKind::BlockedReviewRequired => {
            format!("difference exceeds tolerance, manual review required; {detail}")
        }
    };

    Decision {
        kind,
        totals,
        duplicate_groups,
        tolerance,
        message,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
