use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::compare::FieldChanges;
use crate::key::KeyBuilder;
use crate::model::{
    Bucket, CompositeKey, ExistingRecord, ExistingSnapshot, PerRoute, Route, RouteTotals,
    SaleLine,
};

/// A sale line with its key, route and bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedLine {
    pub bucket: Bucket,
    pub key: CompositeKey,
    pub route: Route,
    pub line: SaleLine,
    pub existing: Option<ExistingRecord>,
    pub changes: FieldChanges,
}

impl ClassifiedLine {
    /// Date whose year selects the partition to write. Updates go where the
    /// persisted row lives.
    pub fn target_date(&self) -> NaiveDate {
        self.existing
            .map(|e| e.sale_date)
            .unwrap_or(self.line.sale_date)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassifyCounts {
    pub new: u64,
    pub update: u64,
    /// All preserved lines, including `cost_preserved`.
    pub preserve: u64,
    /// Preserved lines whose cost alone differed.
    pub cost_preserved: u64,
    /// Same-key lines dropped in favour of a larger net amount.
    pub duplicates_collapsed: u64,
    pub discarded_no_key: u64,
    /// Line type maps to no route.
    pub discarded_unrouted: u64,
}

impl ClassifyCounts {
    pub fn merge(&mut self, other: &ClassifyCounts) {
        self.new += other.new;
        self.update += other.update;
        self.preserve += other.preserve;
        self.cost_preserved += other.cost_preserved;
        self.duplicates_collapsed += other.duplicates_collapsed;
        self.discarded_no_key += other.discarded_no_key;
        self.discarded_unrouted += other.discarded_unrouted;
    }

    pub fn classified(&self) -> u64 {
        self.new + self.update + self.preserve
    }

    pub fn bump(&mut self, bucket: Bucket) {
        match bucket {
            Bucket::New => self.new += 1,
            Bucket::Update => self.update += 1,
            Bucket::Preserve => self.preserve += 1,
        }
    }

    /// Count one kept line in its bucket.
    pub fn record(&mut self, line: &ClassifiedLine) {
        self.bump(line.bucket);
        if line.bucket == Bucket::Preserve && line.changes.cost_only() {
            self.cost_preserved += 1;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchClassification {
    /// One entry per distinct key, in first-seen order.
    pub lines: Vec<ClassifiedLine>,
    pub counts: ClassifyCounts,
    /// Every keyed, routed line of the batch, before duplicates collapse.
    pub staging_totals: PerRoute<RouteTotals>,
}

impl BatchClassification {
    pub fn in_bucket(&self, bucket: Bucket) -> impl Iterator<Item = &ClassifiedLine> {
        self.lines.iter().filter(move |l| l.bucket == bucket)
    }
}

/// Sorts sale lines into NEW / UPDATE / PRESERVE against a snapshot.
pub struct Classifier<'a> {
    snapshot: &'a ExistingSnapshot,
    keys: KeyBuilder,
    epsilon: f64,
}

impl<'a> Classifier<'a> {
    pub fn new(snapshot: &'a ExistingSnapshot, keys: KeyBuilder, epsilon: f64) -> Self {
        Self {
            snapshot,
            keys,
            epsilon,
        }
    }

    /// Classify one batch.
    ///
    /// Lines without a complete key or without a route are counted and
    /// dropped. Lines sharing a key collapse to the one with the largest
    /// absolute net amount; the first line wins a tie.
    pub fn classify_batch<I>(&self, lines: I) -> BatchClassification
    where
        I: IntoIterator<Item = SaleLine>,
    {
        let mut out = BatchClassification::default();
        let mut position: HashMap<CompositeKey, usize> = HashMap::new();
        let mut kept: Vec<(CompositeKey, Route, SaleLine)> = Vec::new();

        for line in lines {
            let key = match self.keys.build(&line) {
                Ok(key) => key,
                Err(_) => {
                    out.counts.discarded_no_key += 1;
                    continue;
                }
            };
            let Some(route) = line.route else {
                out.counts.discarded_unrouted += 1;
                continue;
            };
            out.staging_totals.get_mut(route).add(line.net_amount);

            match position.get(&key) {
                Some(&idx) => {
                    out.counts.duplicates_collapsed += 1;
                    if line.net_amount.abs() > kept[idx].2.net_amount.abs() {
                        kept[idx].2 = line;
                    }
                }
                None => {
                    position.insert(key.clone(), kept.len());
                    kept.push((key, route, line));
                }
            }
        }

        out.lines.reserve(kept.len());
        for (key, route, line) in kept {
            let existing = self.snapshot.get(route, &key).copied();
            let (bucket, changes) = self.bucket_for(&line, existing.as_ref());
            let classified = ClassifiedLine {
                bucket,
                key,
                route,
                line,
                existing,
                changes,
            };
            out.counts.record(&classified);
            out.lines.push(classified);
        }

        out
    }

    /// Bucket for a single line against its persisted mirror.
    pub fn bucket_for(
        &self,
        line: &SaleLine,
        existing: Option<&ExistingRecord>,
    ) -> (Bucket, FieldChanges) {
        let Some(existing) = existing else {
            return (Bucket::New, FieldChanges::default());
        };
        let changes = FieldChanges::between(
            (line.quantity, line.net_amount, line.cost),
            (existing.quantity, existing.net_amount, existing.cost),
            self.epsilon,
        );
        if changes.requires_update() {
            (Bucket::Update, changes)
        } else {
            // Cost alone never triggers a write.
            (Bucket::Preserve, changes)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn line(client: &str, doc: &str, qty: f64, net: f64, cost: f64) -> SaleLine {
        SaleLine {
            client: Some(client.into()),
            agent: Some("V1".into()),
            product: Some("P1".into()),
            document: Some(doc.into()),
            line_type: Some("0".into()),
            line_seq: None,
            sale_date: date(),
            quantity: qty,
            net_amount: net,
            cost,
            route: Some(Route::Confirmed),
            descriptive: BTreeMap::new(),
        }
    }

    fn existing(qty: f64, net: f64, cost: f64) -> ExistingRecord {
        ExistingRecord {
            quantity: qty,
            net_amount: net,
            cost,
            sale_date: date(),
        }
    }

    fn snapshot_with(entries: &[(&SaleLine, ExistingRecord)]) -> ExistingSnapshot {
        let mut snapshot = ExistingSnapshot::default();
        for (l, rec) in entries {
            let key = KeyBuilder::default().build(l).unwrap();
            snapshot.insert(Route::Confirmed, key, *rec);
        }
        snapshot
    }

    #[test]
    fn empty_snapshot_makes_everything_new() {
        let snapshot = ExistingSnapshot::default();
        let classifier = Classifier::new(&snapshot, KeyBuilder::default(), 0.01);
        let batch: Vec<_> = (0..25)
            .map(|i| line("C", &i.to_string(), 1.0, 10.0, 5.0))
            .collect();
        let out = classifier.classify_batch(batch);
        assert_eq!(out.counts.new, 25);
        assert_eq!(out.counts.update, 0);
        assert_eq!(out.counts.preserve, 0);
    }

    #[test]
    fn new_update_preserve_scenario() {
        let a = line("A", "1", 1.0, 10.0, 5.0);
        let b = line("B", "2", 12.0, 120.0, 5.0);
        let c = line("C", "3", 4.0, 40.0, 5.50);
        let snapshot = snapshot_with(&[
            (&b, existing(10.0, 120.0, 5.0)),
            (&c, existing(4.0, 40.0, 5.00)),
        ]);
        let classifier = Classifier::new(&snapshot, KeyBuilder::default(), 0.01);
        let out = classifier.classify_batch(vec![a, b, c]);

        assert_eq!(out.counts.new, 1);
        assert_eq!(out.counts.update, 1);
        assert_eq!(out.counts.preserve, 1);
        assert_eq!(out.counts.cost_preserved, 1);

        let written: Vec<&str> = out
            .lines
            .iter()
            .filter(|l| Bucket::WRITTEN.contains(&l.bucket))
            .map(|l| l.key.client.as_str())
            .collect();
        assert_eq!(written, vec!["A", "B"]);
    }

    #[test]
    fn net_amount_change_is_update() {
        let l = line("A", "1", 1.0, 100.0, 5.0);
        let snapshot = snapshot_with(&[(&l, existing(1.0, 99.0, 5.0))]);
        let classifier = Classifier::new(&snapshot, KeyBuilder::default(), 0.01);
        let out = classifier.classify_batch(vec![l]);
        assert_eq!(out.lines[0].bucket, Bucket::Update);
        assert!(out.lines[0].changes.net_amount);
        assert!(!out.lines[0].changes.quantity);
    }

    #[test]
    fn sub_epsilon_drift_is_preserve() {
        let l = line("A", "1", 1.0, 100.004, 5.0);
        let snapshot = snapshot_with(&[(&l, existing(1.0, 100.0, 5.0))]);
        let classifier = Classifier::new(&snapshot, KeyBuilder::default(), 0.01);
        let out = classifier.classify_batch(vec![l]);
        assert_eq!(out.lines[0].bucket, Bucket::Preserve);
        assert_eq!(out.counts.cost_preserved, 0);
    }

    #[test]
    fn existing_in_other_route_is_not_a_match() {
        let l = line("A", "1", 1.0, 10.0, 5.0);
        let mut snapshot = ExistingSnapshot::default();
        let key = KeyBuilder::default().build(&l).unwrap();
        snapshot.insert(Route::Returns, key, existing(1.0, 10.0, 5.0));
        let classifier = Classifier::new(&snapshot, KeyBuilder::default(), 0.01);
        assert_eq!(classifier.classify_batch(vec![l]).counts.new, 1);
    }

    #[test]
    fn duplicates_collapse_to_largest_absolute_net() {
        let snapshot = ExistingSnapshot::default();
        let classifier = Classifier::new(&snapshot, KeyBuilder::default(), 0.01);
        let out = classifier.classify_batch(vec![
            line("A", "1", 1.0, 10.0, 1.0),
            line("a ", "1", 2.0, -30.0, 1.0),
            line("A", "1", 3.0, 20.0, 1.0),
            line("B", "1", 1.0, 5.0, 1.0),
        ]);
        assert_eq!(out.lines.len(), 2);
        assert_eq!(out.counts.duplicates_collapsed, 2);
        assert_eq!(out.lines[0].line.net_amount, -30.0);
        assert_eq!(out.lines[1].key.client, "B");
        // Totals see every routed line, collapsed or not.
        assert_eq!(out.staging_totals.confirmed.record_count, 4);
        assert_eq!(out.staging_totals.confirmed.sum_net_amount, 5.0);
    }

    #[test]
    fn duplicate_tie_keeps_first() {
        let snapshot = ExistingSnapshot::default();
        let classifier = Classifier::new(&snapshot, KeyBuilder::default(), 0.01);
        let out = classifier.classify_batch(vec![
            line("A", "1", 1.0, 10.0, 1.0),
            line("A", "1", 9.0, -10.0, 1.0),
        ]);
        assert_eq!(out.lines[0].line.quantity, 1.0);
    }

    #[test]
    fn incomplete_and_unrouted_lines_are_counted() {
        let snapshot = ExistingSnapshot::default();
        let classifier = Classifier::new(&snapshot, KeyBuilder::default(), 0.01);
        let mut no_key = line("A", "1", 1.0, 10.0, 1.0);
        no_key.product = None;
        let mut unrouted = line("B", "1", 1.0, 10.0, 1.0);
        unrouted.route = None;
        let out = classifier.classify_batch(vec![no_key, unrouted, line("C", "1", 1.0, 1.0, 1.0)]);
        assert_eq!(out.counts.discarded_no_key, 1);
        assert_eq!(out.counts.discarded_unrouted, 1);
        assert_eq!(out.counts.classified(), 1);
        assert_eq!(out.staging_totals.confirmed.record_count, 1);
    }

    #[test]
    fn update_targets_existing_partition_date() {
        let mut l = line("A", "1", 5.0, 50.0, 1.0);
        l.sale_date = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let mut rec = existing(4.0, 40.0, 1.0);
        rec.sale_date = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        let snapshot = snapshot_with(&[(&l, rec)]);
        let classifier = Classifier::new(&snapshot, KeyBuilder::default(), 0.01);
        let out = classifier.classify_batch(vec![l]);
        assert_eq!(out.lines[0].target_date(), rec.sale_date);
    }
}
