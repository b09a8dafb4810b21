//! Per-label statistics container.
//!
//! A `KPISet` accumulates everything the engine knows about one label:
//! sample counts, success/failure split, response-code histogram, timing
//! sums, deduplicated errors and the response-time distribution. Two sets
//! can be folded together either across sources (same wall-clock second,
//! independent virtual-user populations) or across seconds (same population
//! over time); the two folds differ only in how concurrency combines.

use crate::errors::{merge_entries, ErrorEntry};
use crate::histogram::RespTimeHistogram;
use crate::reader::Sample;
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome class of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Success,
    /// Failure indicated by the response code (4xx/5xx under the default
    /// policy).
    HttpError,
    /// Failure reported by the test tool itself: an error message without a
    /// failing response code.
    ToolError,
}

impl FailureKind {
    pub fn is_failure(&self) -> bool {
        !matches!(self, FailureKind::Success)
    }

    /// Sub-label suffix used when extended aggregation is enabled.
    pub fn label_suffix(&self) -> &'static str {
        match self {
            FailureKind::Success => "-success",
            FailureKind::HttpError => "-http_errors",
            FailureKind::ToolError => "-jmeter_errors",
        }
    }
}

/// Pluggable decision of which samples count as failures.
///
/// The boundary between "failing response code" and "failure only when the
/// tool reports an error" varies between executors, so the classification is
/// a policy rather than a hardcoded rule.
pub trait FailurePolicy: Send {
    fn classify(&self, response_code: &str, error: Option<&str>) -> FailureKind;
}

/// Default policy: response codes parsing to 400 or above fail as HTTP
/// errors; otherwise a present, non-empty error message fails as a tool
/// error.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpFailurePolicy;

impl FailurePolicy for HttpFailurePolicy {
    fn classify(&self, response_code: &str, error: Option<&str>) -> FailureKind {
        if response_code
            .parse::<u16>()
            .map_or(false, |code| code >= 400)
        {
            FailureKind::HttpError
        } else if error.map_or(false, |e| !e.is_empty()) {
            FailureKind::ToolError
        } else {
            FailureKind::Success
        }
    }
}

/// Statistics bundle for one label.
#[derive(Debug, Clone, Serialize)]
pub struct KPISet {
    pub sample_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    /// Maximum concurrency seen for this label within one population; sums
    /// across independent sources when merged.
    pub concurrency: u64,
    pub byte_count: u64,
    pub sum_rt: f64,
    pub sum_cn: f64,
    pub sum_lt: f64,
    pub avg_resp_time: f64,
    pub avg_conn_time: f64,
    pub avg_latency: f64,
    pub response_codes: BTreeMap<String, u64>,
    pub errors: Vec<ErrorEntry>,
    /// Materialized on demand from the histogram, keyed by percentile
    /// formatted with one decimal ("95.0").
    pub percentiles: BTreeMap<String, f64>,
    #[serde(skip)]
    pub resp_times: RespTimeHistogram,
}

impl KPISet {
    pub fn new(histogram_high_ms: u64) -> Self {
        Self {
            sample_count: 0,
            success_count: 0,
            fail_count: 0,
            concurrency: 0,
            byte_count: 0,
            sum_rt: 0.0,
            sum_cn: 0.0,
            sum_lt: 0.0,
            avg_resp_time: 0.0,
            avg_conn_time: 0.0,
            avg_latency: 0.0,
            response_codes: BTreeMap::new(),
            errors: Vec::new(),
            percentiles: BTreeMap::new(),
            resp_times: RespTimeHistogram::new(histogram_high_ms),
        }
    }

    /// Fold one classified sample into this set.
    ///
    /// `track_error` is the registry's admission decision: failures whose
    /// message was dropped by the cap still count as failures, they just
    /// carry no error entry. The caller has already repaired negative
    /// timings.
    pub fn add_sample(&mut self, sample: &Sample, kind: FailureKind, track_error: bool) {
        self.sample_count += 1;
        if kind.is_failure() {
            self.fail_count += 1;
            if track_error {
                let message = match sample.error.as_deref().filter(|e| !e.is_empty()) {
                    Some(error) => error.to_string(),
                    // implicit entry for failures without a message
                    None => format!("HTTP {}", sample.response_code),
                };
                let url = if sample.label.is_empty() {
                    None
                } else {
                    Some(sample.label.as_str())
                };
                let entry = ErrorEntry::new(message, &sample.response_code, url);
                merge_entries(&mut self.errors, std::slice::from_ref(&entry));
            }
        } else {
            self.success_count += 1;
        }
        self.concurrency = self.concurrency.max(sample.concurrency);
        self.byte_count += sample.byte_count;
        *self
            .response_codes
            .entry(sample.response_code.clone())
            .or_insert(0) += 1;
        self.sum_rt += sample.response_time;
        self.sum_cn += sample.connect_time;
        self.sum_lt += sample.latency;
        self.resp_times
            .record((sample.response_time * 1000.0).round() as u64);
        self.recalculate();
    }

    /// Merge a set describing an independent population at the same second:
    /// every scalar sums, including concurrency.
    pub fn merge(&mut self, other: &KPISet) {
        self.fold(other, true);
    }

    /// Fold a later interval of the same population into a running total:
    /// counts and sums accumulate, concurrency takes the maximum seen.
    pub fn accumulate(&mut self, other: &KPISet) {
        self.fold(other, false);
    }

    fn fold(&mut self, other: &KPISet, sum_concurrency: bool) {
        self.sample_count += other.sample_count;
        self.success_count += other.success_count;
        self.fail_count += other.fail_count;
        self.byte_count += other.byte_count;
        self.concurrency = if sum_concurrency {
            self.concurrency + other.concurrency
        } else {
            self.concurrency.max(other.concurrency)
        };
        self.sum_rt += other.sum_rt;
        self.sum_cn += other.sum_cn;
        self.sum_lt += other.sum_lt;
        for (code, count) in &other.response_codes {
            *self.response_codes.entry(code.clone()).or_insert(0) += count;
        }
        merge_entries(&mut self.errors, &other.errors);
        self.resp_times.merge(&other.resp_times);
        self.recalculate();
    }

    /// Fill the `percentiles` map from the histogram. Invoked right before
    /// a set becomes externally visible, not on every sample.
    pub fn materialize_percentiles(&mut self, percentiles: &[f64]) {
        self.percentiles.clear();
        for &p in percentiles {
            let value_secs = self.resp_times.quantile(p) / 1000.0;
            self.percentiles.insert(format_percentile(p), value_secs);
        }
    }

    fn recalculate(&mut self) {
        if self.sample_count == 0 {
            self.avg_resp_time = 0.0;
            self.avg_conn_time = 0.0;
            self.avg_latency = 0.0;
        } else {
            let count = self.sample_count as f64;
            self.avg_resp_time = self.sum_rt / count;
            self.avg_conn_time = self.sum_cn / count;
            self.avg_latency = self.sum_lt / count;
        }
    }
}

impl Default for KPISet {
    fn default() -> Self {
        Self::new(crate::histogram::DEFAULT_HIGH_MS)
    }
}

fn format_percentile(p: f64) -> String {
    format!("{:.1}", p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Sample;

    fn sample(label: &str, rt: f64) -> Sample {
        Sample::new(1, label, rt)
    }

    #[test]
    fn add_sample_routes_success_and_failure() {
        let mut kpi = KPISet::default();
        kpi.add_sample(&sample("home", 0.2), FailureKind::Success, false);
        kpi.add_sample(
            &sample("home", 0.4).with_error("boom"),
            FailureKind::ToolError,
            true,
        );

        assert_eq!(kpi.sample_count, 2);
        assert_eq!(kpi.success_count, 1);
        assert_eq!(kpi.fail_count, 1);
        assert_eq!(kpi.errors.len(), 1);
        assert_eq!(kpi.errors[0].message, "boom");
        assert_eq!(kpi.response_codes["200"], 2);
        assert!((kpi.avg_resp_time - 0.3).abs() < 1e-9);
    }

    #[test]
    fn failure_without_message_gets_implicit_entry() {
        let mut kpi = KPISet::default();
        kpi.add_sample(
            &sample("home", 0.1).with_code("503"),
            FailureKind::HttpError,
            true,
        );

        assert_eq!(kpi.fail_count, 1);
        assert_eq!(kpi.errors[0].message, "HTTP 503");
        let total_error_count: u64 = kpi.errors.iter().map(|e| e.count).sum();
        assert_eq!(total_error_count, kpi.fail_count);
    }

    #[test]
    fn merge_produces_weighted_average() {
        let mut a = KPISet::default();
        a.sample_count = 1;
        a.sum_rt = 0.5;

        let mut b = KPISet::default();
        b.sample_count = 2;
        b.sum_rt = 0.5;

        a.merge(&b);
        assert_eq!(a.sample_count, 3);
        assert!((a.sum_rt - 1.0).abs() < 1e-9);
        assert!((a.avg_resp_time - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn merge_into_empty_set_adopts_other_average() {
        let mut dst = KPISet::default();
        let mut src = KPISet::default();
        src.add_sample(&sample("home", 0.5), FailureKind::Success, false);

        dst.merge(&src);
        assert!((dst.avg_resp_time - src.avg_resp_time).abs() < 1e-9);
    }

    #[test]
    fn merge_sums_concurrency_while_accumulate_maxes() {
        let mut a = KPISet::default();
        a.concurrency = 3;
        let mut b = KPISet::default();
        b.concurrency = 5;

        let mut merged = a.clone();
        merged.merge(&b);
        assert_eq!(merged.concurrency, 8);

        a.accumulate(&b);
        assert_eq!(a.concurrency, 5);
    }

    #[test]
    fn success_plus_fail_equals_sample_count() {
        let mut kpi = KPISet::default();
        for i in 0..10 {
            let kind = if i % 3 == 0 {
                FailureKind::ToolError
            } else {
                FailureKind::Success
            };
            kpi.add_sample(&sample("x", 0.1).with_error("e"), kind, kind.is_failure());
        }
        assert_eq!(kpi.success_count + kpi.fail_count, kpi.sample_count);
    }

    #[test]
    fn percentiles_materialize_from_histogram() {
        let mut kpi = KPISet::default();
        for rt in [0.1, 0.2, 0.3, 0.4, 0.5] {
            kpi.add_sample(&sample("home", rt), FailureKind::Success, false);
        }
        assert!(kpi.percentiles.is_empty());

        kpi.materialize_percentiles(&[0.0, 50.0, 100.0]);
        assert_eq!(kpi.percentiles.len(), 3);
        assert!((kpi.percentiles["0.0"] - 0.1).abs() < 0.01);
        assert!((kpi.percentiles["100.0"] - 0.5).abs() < 0.01);
    }

    #[test]
    fn default_policy_classifies_codes_and_errors() {
        let policy = HttpFailurePolicy;
        assert_eq!(policy.classify("200", None), FailureKind::Success);
        assert_eq!(policy.classify("200", Some("")), FailureKind::Success);
        assert_eq!(policy.classify("200", Some("OK")), FailureKind::ToolError);
        assert_eq!(policy.classify("404", None), FailureKind::HttpError);
        assert_eq!(
            policy.classify("503", Some("down")),
            FailureKind::HttpError
        );
        assert_eq!(policy.classify("UT", Some("x")), FailureKind::ToolError);
    }
}
