//! Maps generic result rows onto sale lines.

use std::collections::BTreeMap;

use salesync_config::ColumnMapping;
use salesync_recon::normalize::{repair_text, split_code_name};
use salesync_recon::{RouteMap, SaleLine};

use crate::error::{Result, SyncError};
use crate::source::{Cell, ResultBatch};

static NULL_CELL: Cell = Cell::Null;

/// Outcome of mapping one batch.
#[derive(Debug, Default)]
pub struct MappedBatch {
    pub lines: Vec<SaleLine>,
    /// Rows whose sale date is missing or unreadable.
    pub rejected: u64,
    /// Descriptive values changed by text repair.
    pub repaired: u64,
}

#[derive(Debug, Clone)]
struct Positions {
    client: usize,
    agent: usize,
    product: usize,
    document: usize,
    line_type: usize,
    line_seq: Option<usize>,
    sale_date: usize,
    quantity: usize,
    net_amount: usize,
    cost: usize,
}

/// Column positions resolved once against the source header.
#[derive(Debug, Clone)]
pub struct LineMapper {
    pos: Positions,
    /// (position, name, split into code/name)
    descriptive: Vec<(usize, String, bool)>,
    routes: RouteMap,
}

impl LineMapper {
    pub fn new(mapping: &ColumnMapping, routes: &RouteMap, columns: &[String]) -> Result<Self> {
        let find = |name: &str| {
            columns.iter().position(|c| c == name).ok_or_else(|| {
                SyncError::configuration(format!(
                    "source result has no column '{name}' (columns: {})",
                    columns.join(", ")
                ))
            })
        };
        let pos = Positions {
            client: find(&mapping.client)?,
            agent: find(&mapping.agent)?,
            product: find(&mapping.product)?,
            document: find(&mapping.document)?,
            line_type: find(&mapping.line_type)?,
            line_seq: mapping.line_seq.as_deref().map(find).transpose()?,
            sale_date: find(&mapping.sale_date)?,
            quantity: find(&mapping.quantity)?,
            net_amount: find(&mapping.net_amount)?,
            cost: find(&mapping.cost)?,
        };

        let mapped = mapping.mapped();
        let descriptive = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !mapped.contains(&c.as_str()))
            .map(|(i, c)| (i, c.clone(), mapping.code_name_columns.contains(c)))
            .collect();

        Ok(Self {
            pos,
            descriptive,
            routes: routes.clone(),
        })
    }

    pub fn map_batch(&self, batch: &ResultBatch) -> MappedBatch {
        let mut out = MappedBatch::default();
        out.lines.reserve(batch.rows.len());
        for row in &batch.rows {
            match self.map_row(row, &mut out.repaired) {
                Some(line) => out.lines.push(line),
                None => out.rejected += 1,
            }
        }
        out
    }

    fn map_row(&self, row: &[Cell], repaired: &mut u64) -> Option<SaleLine> {
        let cell = |i: usize| row.get(i).unwrap_or(&NULL_CELL);
        let text = |i: usize| cell(i).as_text().map(|t| t.into_owned());
        let number = |i: usize| cell(i).as_f64().unwrap_or(0.0);

        let sale_date = cell(self.pos.sale_date).as_date()?;
        let line_type = text(self.pos.line_type);
        let route = line_type.as_deref().and_then(|t| self.routes.resolve(t));

        let mut descriptive = BTreeMap::new();
        for (i, name, split) in &self.descriptive {
            let Some(raw) = cell(*i).as_text() else {
                continue;
            };
            let fixed = repair_text(&raw);
            if fixed != raw {
                *repaired += 1;
            }
            let value = fixed.trim();
            if *split {
                let (code, label) = split_code_name(value);
                descriptive.insert(format!("{name}_code"), code);
                if let Some(label) = label {
                    descriptive.insert(format!("{name}_name"), label);
                }
            } else {
                descriptive.insert(name.clone(), value.to_string());
            }
        }

        Some(SaleLine {
            client: text(self.pos.client),
            agent: text(self.pos.agent),
            product: text(self.pos.product),
            document: text(self.pos.document),
            line_type,
            line_seq: self.pos.line_seq.and_then(text),
            sale_date,
            quantity: number(self.pos.quantity),
            net_amount: number(self.pos.net_amount),
            cost: number(self.pos.cost),
            route,
            descriptive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use salesync_recon::Route;

    fn columns() -> Vec<String> {
        [
            "client_code",
            "agent_code",
            "product_code",
            "document_number",
            "line_type",
            "sale_date",
            "quantity",
            "net_amount",
            "cost",
            "store",
            "seller",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn row(line_type: &str, date: &str, net: Cell) -> Vec<Cell> {
        vec![
            Cell::Text("C1".into()),
            Cell::Int(7),
            Cell::Text("P1".into()),
            Cell::Real(1001.0),
            Cell::Text(line_type.into()),
            Cell::Text(date.into()),
            Cell::Text("2".into()),
            net,
            Cell::Null,
            Cell::Text("SAN JOS╔".into()),
            Cell::Text("07 - MARIA PEÐA".into()),
        ]
    }

    fn mapper() -> LineMapper {
        let mapping = ColumnMapping {
            code_name_columns: vec!["seller".into()],
            ..ColumnMapping::default()
        };
        LineMapper::new(&mapping, &RouteMap::default(), &columns()).unwrap()
    }

    #[test]
    fn maps_fields_routes_and_descriptives() {
        let batch = ResultBatch {
            columns: columns(),
            rows: vec![row("0", "2025-04-02", Cell::Text("1.500,25".into()))],
        };
        let out = mapper().map_batch(&batch);
        assert_eq!(out.rejected, 0);
        assert_eq!(out.repaired, 2);
        let line = &out.lines[0];
        assert_eq!(line.agent.as_deref(), Some("7"));
        assert_eq!(line.document.as_deref(), Some("1001"));
        assert_eq!(line.route, Some(Route::Confirmed));
        assert_eq!(line.sale_date, NaiveDate::from_ymd_opt(2025, 4, 2).unwrap());
        assert_eq!(line.quantity, 2.0);
        assert_eq!(line.net_amount, 1500.25);
        assert_eq!(line.cost, 0.0);
        assert_eq!(line.descriptive["store"], "SAN JOSE");
        assert_eq!(line.descriptive["seller_code"], "07");
        assert_eq!(line.descriptive["seller_name"], "MARIA PEÑA");
    }

    #[test]
    fn unknown_line_type_has_no_route() {
        let batch = ResultBatch {
            columns: columns(),
            rows: vec![row("9", "2025-04-02", Cell::Real(1.0))],
        };
        assert_eq!(mapper().map_batch(&batch).lines[0].route, None);
    }

    #[test]
    fn unreadable_date_is_rejected() {
        let batch = ResultBatch {
            columns: columns(),
            rows: vec![
                row("0", "not a date", Cell::Real(1.0)),
                row("1", "2025-04-03", Cell::Real(-1.0)),
            ],
        };
        let out = mapper().map_batch(&batch);
        assert_eq!(out.rejected, 1);
        assert_eq!(out.lines.len(), 1);
        assert_eq!(out.lines[0].route, Some(Route::Returns));
    }

    #[test]
    fn missing_mapped_column_is_configuration_error() {
        let mut cols = columns();
        cols.retain(|c| c != "cost");
        let err = LineMapper::new(&ColumnMapping::default(), &RouteMap::default(), &cols)
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(ref m) if m.contains("'cost'")));
    }
}
