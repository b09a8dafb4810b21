//! Response-time histogram with a bounded, growable value range.
//!
//! The consolidation engine tracks response-time distributions per label so
//! that merged percentiles can be computed from per-source histograms instead
//! of raw samples. The underlying frequency store is an HDR histogram; this
//! wrapper adds the range policy the engine needs:
//!
//! - values are recorded in whole milliseconds over `[0, high]`
//! - `high` grows by doubling when a larger value arrives, up to a hard
//!   ceiling, and never shrinks
//! - values beyond the ceiling saturate into the top bucket, so tail
//!   percentiles flatten instead of growing without bound
//! - quantile queries never fail; an empty histogram reports 0 everywhere

use hdrhistogram::Histogram;
use std::fmt;
use tracing::debug;

/// Default upper bound when no `histogram-initial` setting is supplied (1s).
pub const DEFAULT_HIGH_MS: u64 = 1_000;

/// Hard ceiling for the trackable range (one hour). Response times above
/// this are clamped into the top bucket.
pub const CEILING_MS: u64 = 3_600_000;

/// Three significant figures keeps sub-millisecond relative error for the
/// value magnitudes a load test produces.
const SIGFIGS: u8 = 3;

/// Fixed-resolution, resizable value-frequency table over `[0, high]`
/// milliseconds.
#[derive(Clone)]
pub struct RespTimeHistogram {
    hist: Histogram<u64>,
    high: u64,
}

impl RespTimeHistogram {
    /// Create a histogram with the given initial upper bound in milliseconds.
    ///
    /// The bound is clamped to `[2, CEILING_MS]`; the range grows on demand
    /// as larger values are recorded.
    pub fn new(initial_high_ms: u64) -> Self {
        let high = initial_high_ms.max(2).min(CEILING_MS);
        Self {
            hist: Self::build(high),
            high,
        }
    }

    fn build(high: u64) -> Histogram<u64> {
        // Bounds are pre-clamped, so construction cannot fail here.
        Histogram::new_with_max(high, SIGFIGS).expect("histogram bounds are pre-validated")
    }

    /// Record one value, growing the range if needed.
    ///
    /// Values above the hard ceiling are saturated into the top bucket
    /// rather than rejected.
    pub fn record(&mut self, value_ms: u64) {
        self.record_n(value_ms, 1);
    }

    /// Record `count` occurrences of one value.
    pub fn record_n(&mut self, value_ms: u64, count: u64) {
        let value = value_ms.min(CEILING_MS);
        if value > self.high && self.high < CEILING_MS {
            let mut wanted = self.high;
            while wanted < value && wanted < CEILING_MS {
                wanted = wanted.saturating_mul(2).min(CEILING_MS);
            }
            self.grow(wanted);
        }
        self.hist.saturating_record_n(value, count);
    }

    /// Widen the trackable range to `new_high`, re-adding existing counts
    /// into the wider layout. Counts are preserved exactly; buckets are only
    /// ever widened, never narrowed.
    fn grow(&mut self, new_high: u64) {
        if new_high <= self.high {
            return;
        }
        let mut wider = Self::build(new_high);
        if wider.add(&self.hist).is_err() {
            // The wider layout is a superset of the current one, so this
            // path is unreachable; keep the old layout if it ever happens.
            debug!("histogram rescale from {} to {} failed", self.high, new_high);
            return;
        }
        self.hist = wider;
        self.high = new_high;
    }

    /// Merge another histogram into this one, bucket for bucket.
    ///
    /// The coarser layout is rescaled up to the finer one first, and `high`
    /// becomes the maximum of the two.
    pub fn merge(&mut self, other: &RespTimeHistogram) {
        if other.high > self.high {
            self.grow(other.high);
        }
        if other.hist.is_empty() {
            return;
        }
        if self.hist.add(&other.hist).is_err() {
            // Same fallback as growth: saturate anything the layout cannot
            // express instead of dropping it.
            for v in other.hist.iter_recorded() {
                self.hist
                    .saturating_record_n(v.value_iterated_to(), v.count_at_value());
            }
        }
    }

    /// Value at the given percentile, in milliseconds.
    ///
    /// `quantile(0)` is the minimum observed value and `quantile(100)` the
    /// maximum; an empty histogram reports 0 for every percentile.
    pub fn quantile(&self, percentile: f64) -> f64 {
        if self.hist.is_empty() {
            return 0.0;
        }
        let value = if percentile <= 0.0 {
            self.hist.min()
        } else if percentile >= 100.0 {
            self.hist.max()
        } else {
            self.hist.value_at_quantile(percentile / 100.0)
        };
        value as f64
    }

    /// Current upper bound of the trackable range, in milliseconds.
    pub fn high(&self) -> u64 {
        self.high
    }

    /// Total number of recorded values.
    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hist.is_empty()
    }
}

impl Default for RespTimeHistogram {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_MS)
    }
}

impl fmt::Debug for RespTimeHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RespTimeHistogram")
            .field("high", &self.high)
            .field("count", &self.hist.len())
            .finish()
    }
}
