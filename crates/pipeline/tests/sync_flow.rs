//! End-to-end sync runs against real SQLite source and destination files.

use std::path::Path;

use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use salesync_config::SyncConfig;
use salesync_io::{DestinationPool, ErrorKind};
use salesync_pipeline::{
    CancellationToken, NoProgress, ProgressEvent, RunRequest, Stage, SyncOrchestrator,
};
use salesync_recon::DecisionKind;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    source: Connection,
    orchestrator: SyncOrchestrator,
}

fn config(dir: &Path) -> SyncConfig {
    let toml = format!(
        r#"
        [source]
        id = "north"
        path = '{source}'
        query = """
            SELECT client_code, agent_code, product_code, document_number, line_type,
                   sale_date, quantity, net_amount, cost, store
            FROM ventas
            WHERE sale_date BETWEEN :start AND :end
            ORDER BY rowid
        """

        [destination]
        path = '{dest}'
        pool_size = 2

        [batch]
        extract_size = 2
        mutate_size = 2
        queue_depth = 1

        [retry]
        attempts = 2
        delay_ms = 1

        [staging]
        dir = '{staging}'
        "#,
        source = dir.join("source.db").display(),
        dest = dir.join("dest.db").display(),
        staging = dir.join("staging").display(),
    );
    SyncConfig::from_toml(&toml).unwrap()
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let source = Connection::open(dir.path().join("source.db")).unwrap();
    source
        .execute_batch(
            "CREATE TABLE ventas (
                client_code TEXT, agent_code TEXT, product_code TEXT, document_number TEXT,
                line_type TEXT, sale_date TEXT, quantity REAL, net_amount REAL, cost REAL,
                store TEXT
            );",
        )
        .unwrap();
    let config = config(dir.path());
    let pool = DestinationPool::open(&config.destination).unwrap();
    let orchestrator = SyncOrchestrator::new(config, pool).unwrap();
    Fixture {
        dir,
        source,
        orchestrator,
    }
}

impl Fixture {
    fn add(&self, client: &str, qty: f64, net: f64, cost: f64) {
        self.source
            .execute(
                "INSERT INTO ventas VALUES (?1, 'V1', 'P1', '1001', '0', '2025-03-10', ?2, ?3, ?4, 'NORTE')",
                params![client, qty, net, cost],
            )
            .unwrap();
    }

    fn set(&self, client: &str, column: &str, value: f64) {
        self.source
            .execute(
                &format!("UPDATE ventas SET {column} = ?1 WHERE client_code = ?2"),
                params![value, client],
            )
            .unwrap();
    }

    fn dest(&self) -> Connection {
        Connection::open(self.dir.path().join("dest.db")).unwrap()
    }

    fn dest_row(&self, client: &str) -> Option<(f64, f64, f64)> {
        self.dest()
            .query_row(
                "SELECT quantity, net_amount, cost FROM infoventas_2025_fact WHERE client_code = ?1",
                [client],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .ok()
    }

    fn audit_rows(&self) -> i64 {
        self.dest()
            .query_row("SELECT COUNT(*) FROM sync_audit", [], |r| r.get(0))
            .unwrap_or(0)
    }
}

fn march() -> RunRequest {
    RunRequest::for_window(
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
    )
}

fn initial_load(f: &Fixture) {
    f.add("B", 10.0, 100.0, 5.0);
    f.add("C", 1.0, 50.0, 5.0);
    let first = f.orchestrator.run(
        RunRequest {
            tolerance: Some(1_000.0),
            ..march()
        },
        &NoProgress,
        &CancellationToken::new(),
    );
    assert!(first.success, "{:?}", first.error);
    assert_eq!(first.new_count, 2);
}

#[test]
fn new_update_and_cost_only_change() {
    let f = fixture();
    initial_load(&f);

    f.add("A", 1.0, 30.0, 2.0);
    f.set("B", "quantity", 12.0);
    f.set("C", "cost", 5.5);

    let result = f
        .orchestrator
        .run(march(), &NoProgress, &CancellationToken::new());
    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        (result.new_count, result.updated_count, result.preserved_count),
        (1, 1, 1)
    );
    assert_eq!(result.counts.cost_preserved, 1);
    assert_eq!(result.duplicate_count, 2);

    let decision = result.decision.unwrap();
    assert_eq!(decision.kind, DecisionKind::ContinueWithWarning);
    let mutation = result.mutation.unwrap();
    assert_eq!((mutation.inserted, mutation.updated), (1, 1));

    assert_eq!(f.dest_row("A"), Some((1.0, 30.0, 2.0)));
    assert_eq!(f.dest_row("B"), Some((12.0, 100.0, 5.0)));
    // Cost history is kept.
    assert_eq!(f.dest_row("C"), Some((1.0, 50.0, 5.0)));
    assert_eq!(f.audit_rows(), 2);
}

#[test]
fn second_identical_run_writes_nothing() {
    let f = fixture();
    initial_load(&f);

    let again = f
        .orchestrator
        .run(march(), &NoProgress, &CancellationToken::new());
    assert!(again.success);
    assert_eq!(again.preserved_count, 2);
    let mutation = again.mutation.unwrap();
    assert_eq!(mutation.rows_written(), 0);
    assert_eq!(mutation.batches_applied, 0);
}

#[test]
fn duplicates_in_different_batches_collapse_once() {
    let f = fixture();
    // Extract size 2 puts the two "X" lines in separate batches.
    f.add("F", 1.0, 5.0, 1.0);
    f.add("X", 1.0, 10.0, 1.0);
    f.add("X", 1.0, 30.0, 1.0);
    let lenient = || RunRequest {
        tolerance: Some(1_000.0),
        ..march()
    };

    let first = f
        .orchestrator
        .run(lenient(), &NoProgress, &CancellationToken::new());
    assert!(first.success, "{:?}", first.error);
    assert_eq!(first.new_count, 2);
    assert_eq!(first.counts.duplicates_collapsed, 1);
    let mutation = first.mutation.unwrap();
    assert_eq!((mutation.inserted, mutation.ignored), (2, 0));
    assert_eq!(f.dest_row("X"), Some((1.0, 30.0, 1.0)));

    let again = f
        .orchestrator
        .run(lenient(), &NoProgress, &CancellationToken::new());
    assert!(again.success, "{:?}", again.error);
    assert_eq!((again.new_count, again.updated_count), (0, 0));
    assert_eq!(again.preserved_count, 2);
    assert_eq!(again.mutation.unwrap().rows_written(), 0);
    assert_eq!(f.dest_row("X"), Some((1.0, 30.0, 1.0)));
}

#[test]
fn difference_beyond_tolerance_blocks_all_writes() {
    let f = fixture();
    initial_load(&f);

    f.add("Z", 1.0, 10_000.0, 1.0);
    let result = f
        .orchestrator
        .run(march(), &NoProgress, &CancellationToken::new());

    assert!(!result.success);
    assert!(result.error.is_none());
    assert_eq!(
        result.decision.as_ref().unwrap().kind,
        DecisionKind::BlockedReviewRequired
    );
    assert!(result.mutation.is_none());
    assert!(result.warnings.iter().any(|w| w.contains("BLOCKED_REVIEW_REQUIRED")));
    assert_eq!(f.dest_row("Z"), None);

    let (decision, status): (String, String) = f
        .dest()
        .query_row(
            "SELECT decision, status FROM sync_audit ORDER BY id DESC LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(decision, "BLOCKED_REVIEW_REQUIRED");
    assert_eq!(status, "ERROR");
}

#[test]
fn discarded_lines_are_reported() {
    let f = fixture();
    f.add("A", 1.0, 10.0, 1.0);
    f.source
        .execute(
            "INSERT INTO ventas VALUES (NULL, 'V1', 'P1', '1002', '0', '2025-03-11', 1, 5, 1, 'X'),
                                       ('D', 'V1', 'P1', '1003', '7', '2025-03-12', 1, 5, 1, 'X')",
            [],
        )
        .unwrap();

    let result = f
        .orchestrator
        .run(march(), &NoProgress, &CancellationToken::new());
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.counts.discarded_no_key, 1);
    assert_eq!(result.counts.discarded_unrouted, 1);
    assert_eq!(result.warnings.len(), 2);
    assert_eq!(f.dest_row("A"), Some((1.0, 10.0, 1.0)));
}

#[test]
fn cancelled_run_leaves_destination_untouched() {
    let f = fixture();
    f.add("A", 1.0, 10.0, 1.0);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = f.orchestrator.run(march(), &NoProgress, &cancel);
    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(f.dest_row("A"), None);
    assert_eq!(f.audit_rows(), 0);
}

#[test]
fn missing_window_is_a_configuration_failure() {
    let f = fixture();
    let result = f
        .orchestrator
        .run(RunRequest::default(), &NoProgress, &CancellationToken::new());
    assert_eq!(result.error.unwrap().kind, ErrorKind::Configuration);
}

#[test]
fn progress_is_monotonic_and_completes() {
    let f = fixture();
    for i in 0..5 {
        f.add(&format!("C{i}"), 1.0, 10.0, 1.0);
    }
    let events = Mutex::new(Vec::<ProgressEvent>::new());
    let sink = |e: &ProgressEvent| events.lock().push(e.clone());

    let result = f.orchestrator.run(march(), &sink, &CancellationToken::new());
    assert!(result.success, "{:?}", result.error);

    let events = events.into_inner();
    assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
    let last = events.last().unwrap();
    assert_eq!((last.stage, last.percent), (Stage::Done, 100));
    assert!(events.iter().any(|e| e.stage == Stage::Mutate));

    // Five rows in batches of two: extraction moves between its bounds.
    let extract: Vec<u8> = events
        .iter()
        .filter(|e| e.stage == Stage::Extract)
        .map(|e| e.percent)
        .collect();
    assert!(extract.iter().any(|p| *p > 5 && *p < 50), "{extract:?}");
    assert_eq!(extract.last(), Some(&50));
    assert!(events
        .iter()
        .filter(|e| e.stage == Stage::Extract)
        .all(|e| e.total == Some(5)));
}

#[test]
fn staging_is_removed_after_runs() {
    let f = fixture();
    initial_load(&f);
    let leftovers = std::fs::read_dir(f.dir.path().join("staging"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}
