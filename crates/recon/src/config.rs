use serde::Deserialize;

use crate::compare::DEFAULT_EPSILON;
use crate::error::ReconError;
use crate::model::Route;
use crate::normalize::canonical_text;

// ---------------------------------------------------------------------------
// Top-level engine config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub tolerance: ToleranceConfig,
    #[serde(default)]
    pub routes: RouteMap,
    /// Duplicate groups above this count are reported as a pre-existing
    /// period reload rather than a warning.
    #[serde(default = "default_duplicate_warning_limit")]
    pub duplicate_warning_limit: u64,
    /// Whether the line sequence column participates in the composite key.
    #[serde(default)]
    pub include_line_seq: bool,
}

fn default_duplicate_warning_limit() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tolerance: ToleranceConfig::default(),
            routes: RouteMap::default(),
            duplicate_warning_limit: default_duplicate_warning_limit(),
            include_line_seq: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ReconError> {
        self.tolerance.validate()?;
        self.routes.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tolerance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ToleranceConfig {
    /// Per-field difference treated as "no change".
    #[serde(default = "default_field_epsilon")]
    pub field_epsilon: f64,
    /// Allowed absolute difference between staging and existing totals.
    #[serde(default = "default_reconciliation")]
    pub reconciliation: f64,
}

fn default_field_epsilon() -> f64 {
    DEFAULT_EPSILON
}

fn default_reconciliation() -> f64 {
    100.0
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            field_epsilon: default_field_epsilon(),
            reconciliation: default_reconciliation(),
        }
    }
}

impl ToleranceConfig {
    pub fn validate(&self) -> Result<(), ReconError> {
        for (name, value) in [
            ("field_epsilon", self.field_epsilon),
            ("reconciliation", self.reconciliation),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ReconError::ConfigValidation(format!(
                    "tolerance.{name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Route mapping
// ---------------------------------------------------------------------------

/// Line-type values routed to each destination partition.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteMap {
    pub confirmed: Vec<String>,
    pub returns: Vec<String>,
}

impl Default for RouteMap {
    fn default() -> Self {
        Self {
            confirmed: vec!["0".into()],
            returns: vec!["1".into()],
        }
    }
}

impl RouteMap {
    /// Route for a line type. Comparison uses the canonical text form, so
    /// `"0"`, `" 0 "` and `"0.0"` all resolve alike.
    pub fn resolve(&self, line_type: &str) -> Option<Route> {
        let wanted = canonical_text(line_type);
        Route::ALL.into_iter().find(|route| {
            self.values(*route)
                .iter()
                .any(|v| canonical_text(v) == wanted)
        })
    }

    pub fn values(&self, route: Route) -> &[String] {
        match route {
            Route::Confirmed => &self.confirmed,
            Route::Returns => &self.returns,
        }
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if self.confirmed.is_empty() && self.returns.is_empty() {
            return Err(ReconError::ConfigValidation(
                "routes: at least one line type must be mapped".into(),
            ));
        }
        for value in &self.confirmed {
            let canonical = canonical_text(value);
            if canonical.is_empty() {
                return Err(ReconError::ConfigValidation(
                    "routes: line type values cannot be blank".into(),
                ));
            }
            if self.returns.iter().any(|r| canonical_text(r) == canonical) {
                return Err(ReconError::AmbiguousRoute { line_type: canonical });
            }
        }
        if self.returns.iter().any(|r| canonical_text(r).is_empty()) {
            return Err(ReconError::ConfigValidation(
                "routes: line type values cannot be blank".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
