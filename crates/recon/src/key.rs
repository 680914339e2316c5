use std::fmt;

use crate::model::{CompositeKey, SaleLine};
use crate::normalize::{canonical_text, repair_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyField {
    Client,
    Agent,
    Product,
    Document,
    LineType,
}

impl fmt::Display for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Agent => write!(f, "agent"),
            Self::Product => write!(f, "product"),
            Self::Document => write!(f, "document"),
            Self::LineType => write!(f, "line_type"),
        }
    }
}

/// A required key field was null or blank after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyError {
    pub field: KeyField,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "missing key field '{}'", self.field)
    }
}

impl std::error::Error for KeyError {}

/// Borrowed raw key fields, from a sale line or a destination row.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyFields<'a> {
    pub client: Option<&'a str>,
    pub agent: Option<&'a str>,
    pub product: Option<&'a str>,
    pub document: Option<&'a str>,
    pub line_type: Option<&'a str>,
    pub line_seq: Option<&'a str>,
}

impl<'a> From<&'a SaleLine> for KeyFields<'a> {
    fn from(line: &'a SaleLine) -> Self {
        Self {
            client: line.client.as_deref(),
            agent: line.agent.as_deref(),
            product: line.product.as_deref(),
            document: line.document.as_deref(),
            line_type: line.line_type.as_deref(),
            line_seq: line.line_seq.as_deref(),
        }
    }
}

/// Derives canonical composite keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyBuilder {
    include_line_seq: bool,
}

impl KeyBuilder {
    pub fn new(include_line_seq: bool) -> Self {
        Self { include_line_seq }
    }

    pub fn includes_line_seq(&self) -> bool {
        self.include_line_seq
    }

    pub fn build(&self, line: &SaleLine) -> Result<CompositeKey, KeyError> {
        self.build_from(KeyFields::from(line))
    }

    /// Fails on the first required field that is missing, in key order.
    /// A zero code is a value, not an absence.
    pub fn build_from(&self, fields: KeyFields<'_>) -> Result<CompositeKey, KeyError> {
        let line_seq = if self.include_line_seq {
            fields.line_seq.map(normalize_field).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(CompositeKey {
            client: required(fields.client, KeyField::Client)?,
            agent: required(fields.agent, KeyField::Agent)?,
            product: required(fields.product, KeyField::Product)?,
            document: required(fields.document, KeyField::Document)?,
            line_type: required(fields.line_type, KeyField::LineType)?,
            line_seq,
        })
    }
}

fn normalize_field(raw: &str) -> String {
    canonical_text(&repair_text(raw))
}

fn required(value: Option<&str>, field: KeyField) -> Result<String, KeyError> {
    let normalized = value.map(normalize_field).unwrap_or_default();
    if normalized.is_empty() {
        return Err(KeyError { field });
    }
    Ok(normalized)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
