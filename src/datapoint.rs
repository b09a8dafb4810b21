//! One wall-clock second of consolidated results.
//!
//! A `DataPoint` carries two label-keyed views: `current` for the second it
//! describes and `cumulative` for everything since the run began, plus the
//! per-source points that were merged to build it.

use crate::kpiset::KPISet;
use serde::Serialize;
use std::collections::BTreeMap;

/// Label used for the overall bucket that unions every non-empty label.
pub const OVERALL_LABEL: &str = "";

#[derive(Debug, Clone, Default, Serialize)]
pub struct DataPoint {
    pub timestamp: u64,
    /// Statistics since the run began, through this second.
    pub cumulative: BTreeMap<String, KPISet>,
    /// Statistics for this second only.
    pub current: BTreeMap<String, KPISet>,
    /// Per-source points merged into this one, in source order.
    pub subresults: Vec<DataPoint>,
}

impl DataPoint {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            cumulative: BTreeMap::new(),
            current: BTreeMap::new(),
            subresults: Vec::new(),
        }
    }

    /// Merge another point for the same second into this one.
    ///
    /// Every label present in `other` is folded label-wise into the
    /// corresponding map here, with concurrency summing since each source
    /// represents an independent virtual-user population. The other point
    /// (or its own subresults, if it is itself a consolidation) is appended
    /// to `subresults` so listeners can still see per-source detail.
    ///
    /// Points at different timestamps must never be merged; the aggregator
    /// buckets strictly by timestamp before calling this.
    pub fn merge_point(&mut self, other: &DataPoint) {
        debug_assert_eq!(
            self.timestamp, other.timestamp,
            "only points for the same second may be merged"
        );
        merge_maps(&mut self.current, &other.current);
        merge_maps(&mut self.cumulative, &other.cumulative);

        if other.subresults.is_empty() {
            let mut sub = other.clone();
            sub.subresults = Vec::new();
            self.subresults.push(sub);
        } else {
            self.subresults.extend(other.subresults.iter().cloned());
        }
    }

    /// Recompute the overall bucket of `current` as the union of all
    /// non-empty labels, folding concurrency by maximum. Used when a point
    /// is assembled from samples of a single source, where every label
    /// shares one virtual-user pool.
    pub fn recalculate_overall(&mut self) {
        let mut overall = KPISet::default();
        let mut seen_any = false;
        for (label, kpi) in &self.current {
            if !label.is_empty() {
                overall.accumulate(kpi);
                seen_any = true;
            }
        }
        if seen_any {
            self.current.insert(OVERALL_LABEL.to_string(), overall);
        }
    }
}

fn merge_maps(dst: &mut BTreeMap<String, KPISet>, src: &BTreeMap<String, KPISet>) {
    for (label, kpi) in src {
        match dst.get_mut(label) {
            Some(existing) => existing.merge(kpi),
            None => {
                dst.insert(label.clone(), kpi.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kpiset::{FailureKind, KPISet};
    use crate::reader::Sample;

    fn point_with(label: &str, ts: u64, rt: f64) -> DataPoint {
        let mut kpi = KPISet::default();
        kpi.add_sample(&Sample::new(ts, label, rt), FailureKind::Success, false);
        kpi.concurrency = 1;
        let mut point = DataPoint::new(ts);
        point.current.insert(label.to_string(), kpi.clone());
        point.recalculate_overall();
        point.cumulative = point.current.clone();
        point
    }

    #[test]
    fn merge_point_folds_labels_and_overall() {
        let mut dst = point_with("first", 3, 0.2);
        let src = point_with("first", 3, 0.4);

        dst.merge_point(&src);
        let overall = &dst.current[OVERALL_LABEL];
        assert_eq!(overall.sample_count, 2);
        assert_eq!(overall.concurrency, 2);
        assert_eq!(dst.current["first"].sample_count, 2);
        assert_eq!(dst.subresults.len(), 1);
    }

    #[test]
    fn merge_point_creates_missing_labels() {
        let mut dst = point_with("first", 5, 0.2);
        let src = point_with("second", 5, 0.3);

        dst.merge_point(&src);
        assert!(dst.current.contains_key("first"));
        assert!(dst.current.contains_key("second"));
        assert_eq!(dst.current[OVERALL_LABEL].sample_count, 2);
    }

    #[test]
    fn merging_consolidated_point_flattens_subresults() {
        let mut consolidated = point_with("a", 1, 0.1);
        consolidated.merge_point(&point_with("b", 1, 0.2));
        assert_eq!(consolidated.subresults.len(), 1);

        let mut outer = point_with("c", 1, 0.3);
        outer.merge_point(&consolidated);
        // the consolidated point contributes its own subresults, not itself
        assert_eq!(outer.subresults.len(), 1);
        assert!(outer.subresults.iter().all(|s| s.subresults.is_empty()));
    }

    #[test]
    fn overall_union_matches_label_totals() {
        let mut point = DataPoint::new(7);
        for (label, rt) in [("a", 0.1), ("b", 0.2), ("c", 0.3)] {
            let mut kpi = KPISet::default();
            kpi.add_sample(&Sample::new(7, label, rt), FailureKind::Success, false);
            point.current.insert(label.to_string(), kpi);
        }
        point.recalculate_overall();

        let overall = &point.current[OVERALL_LABEL];
        assert_eq!(overall.sample_count, 3);
        assert!((overall.sum_rt - 0.6).abs() < 1e-9);
    }
}
