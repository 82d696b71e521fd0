use crate::models::InvalidType;
use crate::unit::MetricUnit;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Validation bookkeeping for one compile pass: memoised lookups plus the
/// strategies found invalid, by reason.
#[derive(Debug, Default)]
pub struct InvalidationLedger {
    metrics_exist: HashSet<String>,
    metrics_missing: HashSet<String>,
    units: HashMap<String, MetricUnit>,
    businesses: Option<HashSet<i64>>,
    invalid: BTreeMap<InvalidType, BTreeSet<i64>>,
    related_ids_map: BTreeMap<i64, BTreeSet<i64>>,
}

impl InvalidationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metric_checked(&self, metric_id: &str) -> Option<bool> {
        if self.metrics_exist.contains(metric_id) {
            Some(true)
        } else if self.metrics_missing.contains(metric_id) {
            Some(false)
        } else {
            None
        }
    }

    pub fn record_metric(&mut self, metric_id: &str, exists: bool) {
        if exists {
            self.metrics_exist.insert(metric_id.to_string());
        } else {
            self.metrics_missing.insert(metric_id.to_string());
        }
    }

    pub fn unit(&mut self, unit: &str) -> &MetricUnit {
        self.units
            .entry(unit.to_string())
            .or_insert_with(|| MetricUnit::load(unit))
    }

    pub fn has_businesses(&self) -> bool {
        self.businesses.is_some()
    }

    pub fn set_businesses(&mut self, businesses: impl IntoIterator<Item = i64>) {
        self.businesses = Some(businesses.into_iter().collect());
    }

    /// Platform-level strategies (business 0) always pass.
    pub fn business_exists(&self, bk_biz_id: i64) -> bool {
        bk_biz_id == 0
            || self
                .businesses
                .as_ref()
                .map_or(true, |known| known.contains(&bk_biz_id))
    }

    pub fn mark(&mut self, reason: InvalidType, strategy_id: i64) {
        if reason != InvalidType::Healthy {
            self.invalid.entry(reason).or_default().insert(strategy_id);
        }
    }

    pub fn invalid_ids(&self, reason: InvalidType) -> BTreeSet<i64> {
        self.invalid.get(&reason).cloned().unwrap_or_default()
    }

    pub fn is_invalid(&self, strategy_id: i64) -> bool {
        self.invalid.values().any(|ids| ids.contains(&strategy_id))
    }

    /// Records that `child` alerts on the alerts of strategy `parent`.
    pub fn relate(&mut self, parent: i64, child: i64) {
        self.related_ids_map.entry(parent).or_default().insert(child);
    }

    pub fn related_ids_map(&self) -> &BTreeMap<i64, BTreeSet<i64>> {
        &self.related_ids_map
    }

    /// Second validation pass: children of broken parents become invalid.
    /// Returns the children newly marked.
    pub fn resolve_related(&mut self) -> BTreeSet<i64> {
        let broken: BTreeSet<i64> = [
            InvalidType::InvalidMetric,
            InvalidType::InvalidTarget,
            InvalidType::DeletedRelatedStrategy,
        ]
        .into_iter()
        .flat_map(|reason| self.invalid_ids(reason))
        .collect();

        let children: BTreeSet<i64> = self
            .related_ids_map
            .iter()
            .filter(|(parent, _)| broken.contains(parent))
            .flat_map(|(_, children)| children.iter().copied())
            .filter(|child| !self.is_invalid(*child))
            .collect();

        for child in &children {
            self.mark(InvalidType::InvalidRelatedStrategy, *child);
        }
        children
    }

    pub fn counts(&self) -> Vec<(InvalidType, usize)> {
        InvalidType::ALL
            .iter()
            .map(|reason| (*reason, self.invalid.get(reason).map_or(0, BTreeSet::len)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_children_follow_broken_parents() {
        let mut ledger = InvalidationLedger::new();
        ledger.mark(InvalidType::InvalidMetric, 1);
        ledger.mark(InvalidType::InvalidUnit, 4);
        ledger.relate(1, 10);
        ledger.relate(4, 11);
        ledger.relate(5, 12);

        let children = ledger.resolve_related();
        assert_eq!(children.into_iter().collect::<Vec<_>>(), vec![10]);
        assert!(ledger.is_invalid(10));
        assert!(!ledger.is_invalid(11));
        assert!(!ledger.is_invalid(12));
    }

    #[test]
    fn memoises_metric_answers() {
        let mut ledger = InvalidationLedger::new();
        assert_eq!(ledger.metric_checked("a.b.c"), None);
        ledger.record_metric("a.b.c", false);
        assert_eq!(ledger.metric_checked("a.b.c"), Some(false));
        assert!(ledger.unit("kbytes").accepts("MB"));
    }

    #[test]
    fn unknown_business_list_accepts_everything() {
        let mut ledger = InvalidationLedger::new();
        assert!(ledger.business_exists(7));
        ledger.set_businesses([2]);
        assert!(!ledger.business_exists(7));
        assert!(ledger.business_exists(0));
    }
}
