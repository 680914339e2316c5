use serde::{Deserialize, Serialize};

use crate::normalize::canonical_text;

/// Default "no change" epsilon, in currency units.
pub const DEFAULT_EPSILON: f64 = 0.01;

/// Absorbs binary rounding so that a difference of exactly `epsilon` in
/// decimal terms still counts as equal.
const ROUNDING_SLACK: f64 = 1e-9;

/// `|a - b| <= epsilon`. Non-finite values never compare equal.
pub fn numbers_equal(a: f64, b: f64, epsilon: f64) -> bool {
    a.is_finite() && b.is_finite() && (a - b).abs() <= epsilon + ROUNDING_SLACK
}

/// Equality after trim, upper-casing and numeric-code canonicalization.
pub fn text_equal(a: &str, b: &str) -> bool {
    canonical_text(a) == canonical_text(b)
}

/// Which financial fields of a line differ from its persisted mirror.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChanges {
    pub quantity: bool,
    pub net_amount: bool,
    pub cost: bool,
}

impl FieldChanges {
    pub fn between(
        (qty_a, net_a, cost_a): (f64, f64, f64),
        (qty_b, net_b, cost_b): (f64, f64, f64),
        epsilon: f64,
    ) -> Self {
        Self {
            quantity: !numbers_equal(qty_a, qty_b, epsilon),
            net_amount: !numbers_equal(net_a, net_b, epsilon),
            cost: !numbers_equal(cost_a, cost_b, epsilon),
        }
    }

    /// Quantity or net amount moved; the line must be rewritten.
    pub fn requires_update(&self) -> bool {
        self.quantity || self.net_amount
    }

    pub fn cost_only(&self) -> bool {
        self.cost && !self.requires_update()
    }
}
