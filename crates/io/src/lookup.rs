//! Snapshot of what the destination already holds for a window.

use chrono::NaiveDate;
use rusqlite::Connection;
use salesync_recon::key::KeyFields;
use salesync_recon::{DateWindow, ExistingRecord, ExistingSnapshot, KeyBuilder, Route};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::partition::PartitionResolver;
use crate::schema::table_exists;

/// Read every destination row inside `window`, keyed the same way staged
/// lines are. Partitions that do not exist yet contribute nothing.
///
/// Totals cover every row in the window; rows whose key cannot be rebuilt
/// still count toward them and are tallied in `skipped`.
pub fn fetch_snapshot(
    conn: &Connection,
    resolver: &PartitionResolver,
    window: &DateWindow,
    keys: &KeyBuilder,
) -> Result<ExistingSnapshot> {
    let mut snapshot = ExistingSnapshot::default();
    let start = window.start.to_string();
    let end = window.end.to_string();

    for route in Route::ALL {
        for table in resolver.for_window(route, window)? {
            if !table_exists(conn, table.name())? {
                debug!("Partition {} not present, nothing to read", table.name());
                continue;
            }
            let sql = format!(
                "SELECT client_code, agent_code, product_code, document_number, line_type,
                        line_seq, sale_date, quantity, net_amount, cost
                 FROM {} WHERE sale_date BETWEEN ?1 AND ?2",
                table.quoted()
            );
            let map = |e| SyncError::from_sqlite("read existing rows", e);
            let mut stmt = conn.prepare(&sql).map_err(map)?;
            let mut rows = stmt.query([&start, &end]).map_err(map)?;
            let mut read = 0u64;
            while let Some(row) = rows.next().map_err(map)? {
                read += 1;
                let raw: [Option<String>; 6] = [
                    row.get(0).map_err(map)?,
                    row.get(1).map_err(map)?,
                    row.get(2).map_err(map)?,
                    row.get(3).map_err(map)?,
                    row.get(4).map_err(map)?,
                    row.get(5).map_err(map)?,
                ];
                let sale_date: String = row.get(6).map_err(map)?;
                let net_amount: f64 = row.get(8).map_err(map)?;
                snapshot.totals.get_mut(route).add(net_amount);

                let fields = KeyFields {
                    client: raw[0].as_deref(),
                    agent: raw[1].as_deref(),
                    product: raw[2].as_deref(),
                    document: raw[3].as_deref(),
                    line_type: raw[4].as_deref(),
                    line_seq: raw[5].as_deref(),
                };
                let (Ok(key), Ok(sale_date)) = (
                    keys.build_from(fields),
                    NaiveDate::parse_from_str(&sale_date, "%Y-%m-%d"),
                ) else {
                    snapshot.skipped += 1;
                    continue;
                };
                let record = ExistingRecord {
                    quantity: row.get(7).map_err(map)?,
                    net_amount,
                    cost: row.get(9).map_err(map)?,
                    sale_date,
                };
                snapshot.insert(route, key, record);
            }
            debug!("Read {} existing row(s) from {}", read, table.name());
        }
    }

    if snapshot.skipped > 0 {
        warn!(
            "{} existing row(s) in {} have an incomplete key and cannot be matched",
            snapshot.skipped, window
        );
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_partition;
    use salesync_config::YearRange;
    use salesync_recon::model::CompositeKey;

    fn resolver() -> PartitionResolver {
        PartitionResolver::new("infoventas", YearRange::default()).unwrap()
    }

    fn insert(conn: &Connection, table: &str, client: &str, date: &str, net: f64) {
        conn.execute(
            &format!(
                "INSERT INTO {table}
                 (client_code, agent_code, product_code, document_number, line_type,
                  sale_date, quantity, net_amount, cost, updated_at)
                 VALUES (?1, 'V1', 'P1', '100', '0', ?2, 1, ?3, 0.5, 'now')"
            ),
            rusqlite::params![client, date, net],
        )
        .unwrap();
    }

    #[test]
    fn reads_window_rows_across_partitions() {
        let conn = Connection::open_in_memory().unwrap();
        let r = resolver();
        for (route, year) in [(Route::Confirmed, 2024), (Route::Confirmed, 2025), (Route::Returns, 2025)] {
            ensure_partition(&conn, &r.resolve(route, year).unwrap()).unwrap();
        }
        insert(&conn, "infoventas_2024_fact", "a", "2024-12-31", 10.0);
        insert(&conn, "infoventas_2025_fact", "b", "2025-01-02", 20.0);
        insert(&conn, "infoventas_2025_fact", "c", "2025-03-01", 99.0);
        insert(&conn, "infoventas_2025_dev", "d", "2025-01-03", -5.0);
        insert(&conn, "infoventas_2025_dev", " ", "2025-01-04", -1.0);

        let window = DateWindow::new(
            NaiveDate::from_ymd_opt(2024, 12, 15).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        )
        .unwrap();
        let snap = fetch_snapshot(&conn, &r, &window, &KeyBuilder::default()).unwrap();

        assert_eq!(snap.len(), 3);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.totals.confirmed.record_count, 2);
        assert_eq!(snap.totals.confirmed.sum_net_amount, 30.0);
        assert_eq!(snap.totals.returns.record_count, 2);
        assert_eq!(snap.totals.returns.sum_net_amount, -6.0);

        let key = CompositeKey {
            client: "A".into(),
            agent: "V1".into(),
            product: "P1".into(),
            document: "100".into(),
            line_type: "0".into(),
            line_seq: String::new(),
        };
        let rec = snap.get(Route::Confirmed, &key).unwrap();
        assert_eq!(rec.sale_date, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        assert_eq!(rec.cost, 0.5);
    }

    #[test]
    fn missing_partitions_yield_empty_snapshot() {
        let conn = Connection::open_in_memory().unwrap();
        let window = DateWindow::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        )
        .unwrap();
        let snap = fetch_snapshot(&conn, &resolver(), &window, &KeyBuilder::default()).unwrap();
        assert!(snap.is_empty());
        assert_eq!(snap.totals.confirmed.record_count, 0);
    }
}
