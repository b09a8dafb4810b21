//! # Load Consolidator
//!
//! Results-consolidation engine for distributed load-testing orchestration.
//! Multiple independent executors (JMeter, Gatling, Selenium, ab, cloud
//! workers) produce raw per-request samples; this library aligns those
//! streams by wall-clock second, merges per-label statistics and emits one
//! consolidated time series to downstream listeners.
//!
//! ## What the engine guarantees
//!
//! - **Bounded memory** over unbounded, arbitrarily-labeled streams: label
//!   cardinality is folded to a configurable ceiling, distinct error
//!   messages are capped, and per-second detail is discarded once a second
//!   has been delivered.
//! - **Statistically sound merged percentiles**, computed from per-source
//!   response-time histograms rather than raw samples.
//! - **Ordered delivery**: every listener sees each finished second exactly
//!   once, in strictly increasing timestamp order.
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `aggregator`: the consolidation state machine driving everything
//! - `reader`: the sample-source contract and per-source reorder buffering
//! - `listener`: the consumer contract for consolidated seconds
//! - `kpiset`: per-label statistics and failure classification
//! - `datapoint`: one consolidated second (current + cumulative views)
//! - `histogram`: bounded, growable response-time distributions
//! - `generalizer`: folding of near-duplicate labels into bounded buckets
//! - `errors`: error deduplication and the run-wide message cap
//! - `config`: the settings surface consumed by the engine
//! - `results`: a JSON-lines results writer implementing the listener side
//! - `logging`: colorized tracing output for embedders
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use load_consolidator::{
//!     AggregatorSettings, ConsolidatingAggregator, RecordingListener, ReplayReader, Sample,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let samples = vec![
//!         Sample::new(1, "home", 0.21),
//!         Sample::new(1, "cart", 0.34),
//!         Sample::new(2, "home", 0.19),
//!     ];
//!
//!     let mut aggregator = ConsolidatingAggregator::new(AggregatorSettings::default());
//!     aggregator.add_underling(Box::new(ReplayReader::new(samples)));
//!
//!     let listener = RecordingListener::new();
//!     aggregator.add_listener(Box::new(listener.clone()));
//!
//!     aggregator.prepare()?;
//!     aggregator.startup()?;
//!     while aggregator.check()? > 0 {}
//!     aggregator.shutdown()?;
//!     aggregator.post_process()?;
//!
//!     println!("consolidated {} seconds", listener.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency Model
//!
//! The aggregation loop is single-threaded and cooperative: one pass per
//! `check()` call, driven by the surrounding orchestration loop. Readers
//! are polled, never waited on; a reader with nothing new simply returns an
//! empty batch. `shutdown()` is the cancellation signal and is safe to call
//! in any state.

/// Consolidation state machine and the aggregator itself.
pub mod aggregator;

/// Settings surface consumed by the engine.
pub mod config;

/// One consolidated wall-clock second.
pub mod datapoint;

/// Error deduplication and the run-wide distinct-message cap.
pub mod errors;

/// Label-cardinality control for templated-URL label explosions.
pub mod generalizer;

/// Response-time histograms with a bounded, growable range.
pub mod histogram;

/// Per-label statistics and failure classification.
pub mod kpiset;

/// Consumer contract for consolidated seconds.
pub mod listener;

/// Colorized tracing output.
pub mod logging;

/// Sample sources and per-source reorder buffering.
pub mod reader;

/// JSON results writer built on the listener contract.
pub mod results;

// Re-export the types embedders touch on every run.

pub use aggregator::{ConsolidatingAggregator, State};
pub use config::{AggregatorSettings, BufferLimit, ConfigError, RampUpWindow};
pub use datapoint::{DataPoint, OVERALL_LABEL};
pub use errors::{ErrorEntry, ErrorRegistry};
pub use generalizer::LabelGeneralizer;
pub use histogram::RespTimeHistogram;
pub use kpiset::{FailureKind, FailurePolicy, HttpFailurePolicy, KPISet};
pub use listener::{Listener, RecordingListener};
pub use reader::{Reader, ReplayReader, Sample};
pub use results::JsonResultsWriter;

/// Crate version, embedded in result summaries for reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
///
/// These defaults suit typical HTTP load tests; every one of them can be
/// overridden through [`AggregatorSettings`].
pub mod defaults {
    /// Percentiles materialized on delivered KPISets.
    ///
    /// The spread covers the median, the common SLO points and both
    /// extremes, which also serve as observed min/max.
    pub const TRACK_PERCENTILES: &[f64] = &[0.0, 50.0, 90.0, 95.0, 99.0, 99.9, 100.0];

    /// Cap on globally distinct tracked error messages.
    ///
    /// Distinct messages past the cap are dropped entirely; 100 keeps
    /// pathological error storms from growing state without losing the
    /// variety a normal run produces.
    pub const MAX_ERROR_COUNT: usize = 100;

    /// Initial response-time histogram upper bound, in seconds.
    ///
    /// The bound doubles automatically when slower responses arrive, so
    /// this only needs to cover the common case.
    pub const HISTOGRAM_INITIAL: f64 = 1.0;

    /// Minimum number of seconds a source's newest data is held back to
    /// absorb out-of-order arrival.
    pub const MIN_BUFFER_LEN: usize = 2;

    /// Multiplier applied to observed response times when scaling the
    /// per-source holdback.
    pub const BUFFER_MULTIPLIER: f64 = 2.0;

    /// Percentile of observed response times driving the adaptive
    /// holdback depth.
    pub const BUFFER_SCALE: f64 = 90.0;

    /// Seed for the label-folding heuristic, so identical runs fold
    /// identically.
    pub const GENERALIZER_SEED: u64 = 42;
}
