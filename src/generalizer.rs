//! Label-cardinality control.
//!
//! Load scripts with templated URLs can produce an effectively unbounded
//! set of labels. Once the number of distinct labels reaches a configured
//! ceiling, structurally similar labels are folded into synthetic buckets:
//! the shared literal prefix/suffix survives and the variable middle is
//! replaced with `*`. The heuristic is intentionally approximate; callers
//! get bounded cardinality, not exact bucket assignments. All random
//! choices come from a seeded generator, so a given seed reproduces the
//! same folds.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// How many existing buckets are aligned against one new label.
const SAMPLE_LIMIT: usize = 32;

/// Upper bound on memoized raw-label folds. Past this, folds are recomputed
/// per occurrence instead of cached.
const FOLD_MEMO_LIMIT: usize = 16_384;

/// Labels are grouped into length bands of this many characters; folding
/// only aligns labels within one band, which keeps short and long URLs from
/// collapsing into one bucket.
const BAND_WIDTH: usize = 8;

/// Fold decision for one incoming label. The caller owns the KPISet maps
/// and applies the corresponding merges.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// Admit the label as its own bucket (or it already is one).
    Keep,
    /// Fold the label into an existing bucket.
    MapTo(String),
    /// Create a synthetic bucket and absorb the listed existing buckets
    /// into it.
    Regroup { bucket: String, absorb: Vec<String> },
}

pub struct LabelGeneralizer {
    limit: usize,
    rng: StdRng,
    folds: HashMap<String, String>,
}

impl LabelGeneralizer {
    pub fn new(limit: usize, seed: u64) -> Self {
        Self {
            limit,
            rng: StdRng::seed_from_u64(seed),
            folds: HashMap::new(),
        }
    }

    /// Decide where `label` goes, given the current non-overall bucket set.
    ///
    /// Guarantees, regardless of input order: the bucket count never
    /// exceeds `limit`, and regrouping never shrinks it below `limit / 2`,
    /// so genuinely distinct labels cannot degenerate into a single bucket.
    pub fn assign(&mut self, label: &str, known: &[String]) -> Assignment {
        if let Some(bucket) = self.folds.get(label) {
            return Assignment::MapTo(bucket.clone());
        }
        if known.iter().any(|k| k == label) {
            return Assignment::Keep;
        }
        if let Some(bucket) = known.iter().find(|b| matches_pattern(b.as_str(), label)) {
            let bucket = bucket.clone();
            self.memoize(label, &bucket);
            return Assignment::MapTo(bucket);
        }
        if known.len() < self.limit {
            return Assignment::Keep;
        }

        // At the ceiling. Align against a sample of buckets in the same
        // length band.
        let band = band_of(label);
        let mut pool: Vec<&String> = known
            .iter()
            .filter(|b| band_of(b.as_str()) == band)
            .collect();
        if pool.is_empty() {
            pool = known.iter().collect();
        }
        if pool.len() > SAMPLE_LIMIT {
            let mut sampled = Vec::with_capacity(SAMPLE_LIMIT);
            for _ in 0..SAMPLE_LIMIT {
                sampled.push(pool[self.rng.gen_range(0..pool.len())]);
            }
            pool = sampled;
        }

        let mut best: &String = pool[0];
        let mut best_score = 0usize;
        for &candidate in &pool {
            let score = common_prefix_len(label, candidate) + common_suffix_len(label, candidate);
            if score > best_score {
                best_score = score;
                best = candidate;
            }
        }

        let label_len = label.chars().count();
        let min_len = label_len.min(best.chars().count());
        if min_len > 0 && 2 * best_score >= min_len {
            let prefix_len = common_prefix_len(label, best);
            let suffix_len = common_suffix_len(label, best).min(min_len - prefix_len);
            let prefix: String = label.chars().take(prefix_len).collect();
            let suffix: String = label.chars().skip(label_len - suffix_len).collect();
            let bucket = format!("{}*{}", prefix, suffix);

            let mut absorb = vec![best.clone()];
            for candidate in known {
                if known.len() - absorb.len() <= self.limit / 2 + 1 {
                    break;
                }
                if candidate != best
                    && band_of(candidate) == band
                    && matches_pattern(&bucket, candidate)
                {
                    absorb.push(candidate.clone());
                }
            }
            self.memoize(label, &bucket);
            Assignment::Regroup { bucket, absorb }
        } else {
            // Weak alignment: glue to a nearby bucket anyway, usually the
            // best match, occasionally a random one.
            let target = if self.rng.gen_bool(0.7) {
                best.clone()
            } else {
                (*pool[self.rng.gen_range(0..pool.len())]).clone()
            };
            self.memoize(label, &target);
            Assignment::MapTo(target)
        }
    }

    fn memoize(&mut self, label: &str, bucket: &str) {
        if self.folds.len() < FOLD_MEMO_LIMIT {
            self.folds.insert(label.to_string(), bucket.to_string());
        }
    }
}

/// A bucket with a `*` matches any label carrying its literal prefix and
/// suffix. Plain buckets match only themselves, which `assign` checks
/// separately.
fn matches_pattern(bucket: &str, label: &str) -> bool {
    match bucket.split_once('*') {
        Some((prefix, suffix)) => {
            label.len() >= prefix.len() + suffix.len()
                && label.starts_with(prefix)
                && label.ends_with(suffix)
        }
        None => false,
    }
}

fn band_of(label: &str) -> usize {
    label.chars().count() / BAND_WIDTH
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count()
}

fn common_suffix_len(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Minimal replica of the aggregator's bookkeeping: apply assignments
    /// to a bucket set and return the final buckets.
    fn drive(labels: impl IntoIterator<Item = String>, limit: usize) -> BTreeSet<String> {
        let mut generalizer = LabelGeneralizer::new(limit, 42);
        let mut known: Vec<String> = Vec::new();
        for label in labels {
            match generalizer.assign(&label, &known) {
                Assignment::Keep => {
                    if !known.contains(&label) {
                        known.push(label);
                    }
                }
                Assignment::MapTo(_) => {}
                Assignment::Regroup { bucket, absorb } => {
                    known.retain(|k| !absorb.contains(k));
                    if !known.contains(&bucket) {
                        known.push(bucket);
                    }
                }
            }
        }
        known.into_iter().collect()
    }

    #[test]
    fn below_limit_labels_stay_distinct() {
        let labels = ["/reserve", "/purchase", "/vacation", "/confirm", "/other"];
        let buckets = drive(labels.iter().map(|l| l.to_string()), 25);
        assert_eq!(buckets.len(), 5);
    }

    #[test]
    fn wildcard_bucket_absorbs_matching_labels() {
        let mut generalizer = LabelGeneralizer::new(4, 1);
        let known = vec!["/api/user/*".to_string(), "/home".to_string()];
        assert_eq!(
            generalizer.assign("/api/user/1234", &known),
            Assignment::MapTo("/api/user/*".to_string())
        );
    }

    #[test]
    fn repeated_label_is_memoized_to_same_bucket() {
        let mut generalizer = LabelGeneralizer::new(2, 7);
        let known = vec!["/api/a/1".to_string(), "/api/a/2".to_string()];
        let first = generalizer.assign("/api/a/3", &known);
        let second = generalizer.assign("/api/a/3", &known);
        match (first, second) {
            (Assignment::Regroup { bucket, .. }, Assignment::MapTo(again)) => {
                assert_eq!(bucket, again);
            }
            other => panic!("unexpected assignments: {:?}", other),
        }
    }

    #[test]
    fn cardinality_stays_within_bounds_for_templated_urls() {
        let limit = 25usize;
        let labels = (0..200).map(|i| {
            // templated URLs: shared literal prefix, variable query value
            format!("http://site.example/?foo={:0width$x}", i * 37, width = 1 + i % 16)
        });
        let buckets = drive(labels, limit);
        assert!(
            buckets.len() <= limit,
            "bucket count {} exceeded limit {}",
            buckets.len(),
            limit
        );
        assert!(
            buckets.len() >= limit / 2,
            "bucket count {} degenerated below {}",
            buckets.len(),
            limit / 2
        );
    }

    #[test]
    fn shrinking_labels_never_collapse_to_one_bucket() {
        let limit = 50usize;
        let count = 500usize;
        let base = "http://site.example/?foo=";
        let labels = (0..count).map(|i| {
            let target = (limit * 2).saturating_sub(limit * i / count).max(base.len() + 1);
            let mut label = base.to_string();
            while label.chars().count() < target {
                label.push(char::from(b'a' + (i % 26) as u8));
            }
            label
        });
        let buckets = drive(labels, limit);
        assert!(buckets.len() <= limit);
        assert!(buckets.len() >= limit / 4);
    }
}
