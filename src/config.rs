//! Aggregator configuration surface.
//!
//! The engine does not own config loading; the surrounding orchestration
//! hands it a settings document (typically a JSON object with kebab-case
//! keys). Type errors surface when the document is converted, range errors
//! when the aggregator validates at `prepare()` time — both before any
//! sample is consumed.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::defaults;

/// Validation or conversion failure in the settings document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid settings document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("track-percentiles value {0} is outside the [0, 100] range")]
    PercentileOutOfRange(f64),
    #[error("histogram-initial must be positive, got {0}")]
    NonPositiveHistogramBound(f64),
    #[error("max-error-count must be at least 1")]
    ZeroErrorCap,
    #[error("min-buffer-len must be at least 1")]
    ZeroBufferFloor,
    #[error("buffer-scale {0} is outside the [0, 100] range")]
    BufferScaleOutOfRange(f64),
    #[error("buffer-multiplier must be positive, got {0}")]
    NonPositiveBufferMultiplier(f64),
}

/// Force-flush threshold for the alignment buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLimit {
    /// Force-flush the oldest second once more than this many are buffered.
    Finite(usize),
    /// Never force-flush; wait for every source indefinitely.
    Infinite,
}

impl BufferLimit {
    pub fn is_finite(&self) -> bool {
        matches!(self, BufferLimit::Finite(_))
    }
}

impl Serialize for BufferLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BufferLimit::Finite(n) => serializer.serialize_u64(*n as u64),
            BufferLimit::Infinite => serializer.serialize_str("inf"),
        }
    }
}

impl<'de> Deserialize<'de> for BufferLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(BufferLimit::Finite(n as usize)),
            Raw::Text(text) if text.eq_ignore_ascii_case("inf") => Ok(BufferLimit::Infinite),
            Raw::Text(text) => Err(D::Error::custom(format!(
                "max-buffer-len must be a number or \"inf\", got {:?}",
                text
            ))),
        }
    }
}

/// One ramp-up exclusion window: samples for any of `labels` recorded
/// within `duration` seconds of the scenario's first observed sample are
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampUpWindow {
    pub labels: Vec<String>,
    pub duration: u64,
}

/// Everything the consolidation engine can be told.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AggregatorSettings {
    /// Percentiles materialized on every delivered KPISet; empty disables
    /// percentile computation entirely.
    pub track_percentiles: Vec<f64>,
    /// Split each label into per-outcome sub-labels.
    pub extend_aggregation: bool,
    /// Ceiling on distinct labels; 0 disables folding.
    pub generalize_labels: usize,
    /// Cap on globally distinct tracked error messages.
    pub max_error_count: usize,
    pub max_buffer_len: BufferLimit,
    /// Initial response-time histogram upper bound, seconds.
    pub histogram_initial: f64,
    pub ramp_up_exclude: bool,
    pub ramp_up: Vec<RampUpWindow>,
    pub min_buffer_len: usize,
    pub buffer_multiplier: f64,
    /// Percentile of observed response times that drives the adaptive
    /// per-source buffer depth.
    pub buffer_scale: f64,
    pub generalizer_seed: u64,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            track_percentiles: defaults::TRACK_PERCENTILES.to_vec(),
            extend_aggregation: false,
            generalize_labels: 0,
            max_error_count: defaults::MAX_ERROR_COUNT,
            max_buffer_len: BufferLimit::Infinite,
            histogram_initial: defaults::HISTOGRAM_INITIAL,
            ramp_up_exclude: false,
            ramp_up: Vec::new(),
            min_buffer_len: defaults::MIN_BUFFER_LEN,
            buffer_multiplier: defaults::BUFFER_MULTIPLIER,
            buffer_scale: defaults::BUFFER_SCALE,
            generalizer_seed: defaults::GENERALIZER_SEED,
        }
    }
}

impl AggregatorSettings {
    /// Convert a settings document. A wrong-typed option (say, a
    /// non-numeric `max-error-count`) fails here rather than mid-run.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        let settings: AggregatorSettings = serde_json::from_value(value)?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for &p in &self.track_percentiles {
            if !(0.0..=100.0).contains(&p) {
                return Err(ConfigError::PercentileOutOfRange(p));
            }
        }
        if self.histogram_initial <= 0.0 {
            return Err(ConfigError::NonPositiveHistogramBound(
                self.histogram_initial,
            ));
        }
        if self.max_error_count == 0 {
            return Err(ConfigError::ZeroErrorCap);
        }
        if self.min_buffer_len == 0 {
            return Err(ConfigError::ZeroBufferFloor);
        }
        if !(0.0..=100.0).contains(&self.buffer_scale) {
            return Err(ConfigError::BufferScaleOutOfRange(self.buffer_scale));
        }
        if self.buffer_multiplier <= 0.0 {
            return Err(ConfigError::NonPositiveBufferMultiplier(
                self.buffer_multiplier,
            ));
        }
        Ok(())
    }

    /// Initial histogram upper bound in whole milliseconds.
    pub fn histogram_high_ms(&self) -> u64 {
        (self.histogram_initial * 1000.0).round() as u64
    }
}
