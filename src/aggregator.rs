//! The consolidation engine.
//!
//! A [`ConsolidatingAggregator`] owns a set of underling readers and a set
//! of listeners. Each cooperative pass polls every live reader, groups the
//! resulting samples into per-source per-second points, aligns those points
//! by wall-clock second, and — once every live source has moved past a
//! second — merges them into one consolidated [`DataPoint`], folds it into
//! the run-wide cumulative state and hands a copy to every listener.
//!
//! The loop is single-threaded and driven from outside: one pass per
//! `check()` call, no internal timers. `shutdown()` is the cooperative
//! cancellation signal; seconds buffered at that moment stay recoverable
//! through `post_process()`.

use crate::config::{AggregatorSettings, BufferLimit, RampUpWindow};
use crate::datapoint::DataPoint;
use crate::errors::ErrorRegistry;
use crate::generalizer::{Assignment, LabelGeneralizer};
use crate::kpiset::{FailurePolicy, HttpFailurePolicy, KPISet};
use crate::listener::Listener;
use crate::reader::{ClassifiedSample, Reader, ReaderBuffer, Sample};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Lifecycle of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Prepared,
    Running,
    Stopped,
    Finalized,
}

/// One registered reader plus its consolidation-side state.
struct Underling {
    reader: Box<dyn Reader>,
    buffer: ReaderBuffer,
    /// Set when `poll` errored; the reader is excluded from all further
    /// alignment waits for the rest of the run.
    failed: bool,
    /// Set when the reader reported a permanent end of stream.
    finished: bool,
    /// Highest second drained from this reader so far.
    watermark: Option<u64>,
}

/// Per-scenario ramp-up exclusion. A scenario's logical start is the first
/// timestamp observed for any of its labels.
struct RampUpFilter {
    by_label: HashMap<String, (usize, u64)>,
    starts: HashMap<usize, u64>,
}

impl RampUpFilter {
    fn new(windows: &[RampUpWindow]) -> Self {
        let mut by_label = HashMap::new();
        for (scenario, window) in windows.iter().enumerate() {
            for label in &window.labels {
                by_label.insert(label.clone(), (scenario, window.duration));
            }
        }
        Self {
            by_label,
            starts: HashMap::new(),
        }
    }

    fn excludes(&mut self, label: &str, timestamp: u64) -> bool {
        match self.by_label.get(label) {
            Some(&(scenario, duration)) => {
                let start = *self.starts.entry(scenario).or_insert(timestamp);
                timestamp < start.saturating_add(duration)
            }
            None => false,
        }
    }
}

/// Merges per-second results from any number of independent sample streams
/// into one consolidated time series.
pub struct ConsolidatingAggregator {
    settings: AggregatorSettings,
    state: State,
    policy: Box<dyn FailurePolicy>,
    underlings: Vec<Underling>,
    listeners: Vec<Box<dyn Listener>>,
    /// Run-wide per-label statistics; reset only by `prepare()`.
    cumulative: BTreeMap<String, KPISet>,
    known_errors: ErrorRegistry,
    generalizer: Option<LabelGeneralizer>,
    ramp_up: Option<RampUpFilter>,
    /// Seconds awaiting consolidation: timestamp to per-reader points.
    buffer: BTreeMap<u64, BTreeMap<usize, DataPoint>>,
    last_delivered: Option<u64>,
    histogram_high_ms: u64,
}

impl ConsolidatingAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        let histogram_high_ms = settings.histogram_high_ms();
        let known_errors = ErrorRegistry::new(settings.max_error_count);
        Self {
            settings,
            state: State::Created,
            policy: Box::new(HttpFailurePolicy),
            underlings: Vec::new(),
            listeners: Vec::new(),
            cumulative: BTreeMap::new(),
            known_errors,
            generalizer: None,
            ramp_up: None,
            buffer: BTreeMap::new(),
            last_delivered: None,
            histogram_high_ms,
        }
    }

    /// Replace the failure-classification policy before the run starts.
    pub fn set_failure_policy(&mut self, policy: Box<dyn FailurePolicy>) {
        self.policy = policy;
    }

    /// Settings may be adjusted until `prepare()` picks them up.
    pub fn settings_mut(&mut self) -> &mut AggregatorSettings {
        &mut self.settings
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn add_underling(&mut self, reader: Box<dyn Reader>) {
        let buffer = ReaderBuffer::new(
            self.settings.min_buffer_len,
            self.settings.buffer_multiplier,
            self.settings.buffer_scale,
            self.settings.histogram_high_ms(),
        );
        self.underlings.push(Underling {
            reader,
            buffer,
            failed: false,
            finished: false,
            watermark: None,
        });
    }

    pub fn add_listener(&mut self, listener: Box<dyn Listener>) {
        self.listeners.push(listener);
    }

    /// Validate settings and reset all run state. Underlings stay
    /// registered; their buffered samples are discarded.
    pub fn prepare(&mut self) -> Result<()> {
        self.settings
            .validate()
            .context("aggregator settings rejected")?;
        self.histogram_high_ms = self.settings.histogram_high_ms();
        self.cumulative.clear();
        self.known_errors = ErrorRegistry::new(self.settings.max_error_count);
        self.generalizer = if self.settings.generalize_labels > 0 {
            Some(LabelGeneralizer::new(
                self.settings.generalize_labels,
                self.settings.generalizer_seed,
            ))
        } else {
            None
        };
        self.ramp_up = if self.settings.ramp_up_exclude {
            Some(RampUpFilter::new(&self.settings.ramp_up))
        } else {
            None
        };
        self.buffer.clear();
        self.last_delivered = None;
        for underling in &mut self.underlings {
            underling.buffer = ReaderBuffer::new(
                self.settings.min_buffer_len,
                self.settings.buffer_multiplier,
                self.settings.buffer_scale,
                self.settings.histogram_high_ms(),
            );
            underling.failed = false;
            underling.finished = false;
            underling.watermark = None;
        }
        self.state = State::Prepared;
        info!("consolidating aggregator prepared");
        Ok(())
    }

    /// Begin consuming samples. Runs `prepare()` first if it was skipped.
    pub fn startup(&mut self) -> Result<()> {
        if self.state == State::Created {
            self.prepare()?;
        }
        self.state = State::Running;
        info!(
            "consolidation started with {} underlings and {} listeners",
            self.underlings.len(),
            self.listeners.len()
        );
        Ok(())
    }

    /// One cooperative pass; returns how many seconds were consolidated and
    /// delivered.
    pub fn check(&mut self) -> Result<usize> {
        Ok(self.process(false)?.len())
    }

    /// Like `check()`, but returns the consolidated points. A final pass
    /// drains everything that is still buffered.
    pub fn datapoints(&mut self, is_final: bool) -> Result<Vec<DataPoint>> {
        self.process(is_final)
    }

    /// Stop accepting new samples from periodic passes. Safe in any state;
    /// buffered seconds remain recoverable via `post_process()`.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state != State::Finalized {
            self.state = State::Stopped;
            info!("consolidation stopped");
        }
        Ok(())
    }

    /// Flush every remaining second in timestamp order, give listeners
    /// their final delivery, and finalize.
    pub fn post_process(&mut self) -> Result<()> {
        if self.state == State::Finalized {
            return Ok(());
        }
        self.process(true)?;
        for listener in &mut self.listeners {
            listener.finalize().context("listener finalize failed")?;
        }
        self.state = State::Finalized;
        info!(
            "consolidation finalized, {} labels in cumulative",
            self.cumulative.len()
        );
        Ok(())
    }

    /// Run-wide per-label statistics, through the last consolidated second.
    pub fn cumulative(&self) -> &BTreeMap<String, KPISet> {
        &self.cumulative
    }

    /// Distinct error messages admitted so far.
    pub fn known_error_count(&self) -> usize {
        self.known_errors.len()
    }

    /// Reader-local cumulative statistics, before consolidation.
    pub fn underling_cumulative(&self, index: usize) -> Option<&BTreeMap<String, KPISet>> {
        self.underlings.get(index).map(|u| u.buffer.cumulative())
    }

    /// Seconds currently awaiting consolidation.
    pub fn buffered_seconds(&self) -> usize {
        self.buffer.len()
    }

    fn process(&mut self, is_final: bool) -> Result<Vec<DataPoint>> {
        if self.state == State::Finalized {
            return Ok(Vec::new());
        }
        if self.state == State::Created {
            self.prepare()?;
        }

        // 1. Poll readers. Periodic passes only ingest while running; a
        // final pass recovers whatever the readers already produced.
        if self.state == State::Running || is_final {
            for index in 0..self.underlings.len() {
                if self.underlings[index].failed || self.underlings[index].finished {
                    continue;
                }
                let polled = self.underlings[index].reader.poll();
                match polled {
                    Ok(samples) => {
                        for sample in samples {
                            let classified = Self::preprocess(
                                &self.settings,
                                self.policy.as_ref(),
                                self.ramp_up.as_mut(),
                                &mut self.known_errors,
                                sample,
                            );
                            if let Some(classified) = classified {
                                self.underlings[index].buffer.ingest(classified);
                            }
                        }
                        if self.underlings[index].reader.is_finished() {
                            self.underlings[index].finished = true;
                            debug!("reader {} reported end of stream", index);
                        }
                    }
                    Err(err) => {
                        warn!(
                            "reader {} failed, excluding it from consolidation: {:#}",
                            index, err
                        );
                        self.underlings[index].failed = true;
                    }
                }
            }
        }

        // 2. Drain per-reader seconds into the alignment buffer. Finished
        // readers release everything they still hold.
        for index in 0..self.underlings.len() {
            if self.underlings[index].failed {
                continue;
            }
            let force = is_final || self.underlings[index].finished;
            let points = self.underlings[index].buffer.drain(force);
            for point in points {
                self.underlings[index].watermark = Some(point.timestamp);
                if self.last_delivered.map_or(false, |last| point.timestamp <= last) {
                    // the second already went out (force-flush); late data
                    // is dropped rather than re-delivered
                    debug!(
                        "dropping late second {} from reader {}",
                        point.timestamp, index
                    );
                    continue;
                }
                self.buffer
                    .entry(point.timestamp)
                    .or_default()
                    .insert(index, point);
            }
        }

        // 3. A second is ready once every live reader has moved past it.
        let mut ready: Vec<u64> = Vec::new();
        for (&ts, _) in &self.buffer {
            let all_passed = self.underlings.iter().all(|u| {
                u.failed || u.finished || u.watermark.map_or(false, |w| w >= ts)
            });
            if is_final || all_passed {
                ready.push(ts);
            } else {
                break;
            }
        }

        // 4. Overflow protection: past the limit the oldest second goes out
        // with whatever sources have reported.
        if let BufferLimit::Finite(limit) = self.settings.max_buffer_len {
            let keys: Vec<u64> = self.buffer.keys().copied().collect();
            while keys.len() - ready.len() > limit {
                let ts = keys[ready.len()];
                warn!(
                    "alignment buffer exceeded {} seconds, force-flushing second {} with partial data",
                    limit, ts
                );
                ready.push(ts);
            }
        }

        // 5. Consolidate, fold into cumulative, deliver.
        let high = self.histogram_high_ms;
        let mut delivered = Vec::with_capacity(ready.len());
        for ts in ready {
            let sources = match self.buffer.remove(&ts) {
                Some(sources) => sources,
                None => continue,
            };
            let mut point = DataPoint::new(ts);
            for source_point in sources.values() {
                point.merge_point(source_point);
            }
            self.apply_generalization(&mut point);
            for (label, kpi) in &point.current {
                self.cumulative
                    .entry(label.clone())
                    .or_insert_with(|| KPISet::new(high))
                    .accumulate(kpi);
            }
            point.cumulative = self.cumulative.clone();
            if !self.settings.track_percentiles.is_empty() {
                let track = &self.settings.track_percentiles;
                for kpi in point.current.values_mut() {
                    kpi.materialize_percentiles(track);
                }
                for kpi in point.cumulative.values_mut() {
                    kpi.materialize_percentiles(track);
                }
            }
            debug_assert!(
                self.last_delivered.map_or(true, |last| ts > last),
                "seconds must be delivered in strictly increasing order"
            );
            for listener in &mut self.listeners {
                listener.aggregated_second(&point);
            }
            self.last_delivered = Some(ts);
            delivered.push(point);
        }
        Ok(delivered)
    }

    /// Repair, filter and classify one raw sample. Returns `None` when the
    /// sample is excluded by a ramp-up window.
    fn preprocess(
        settings: &AggregatorSettings,
        policy: &dyn FailurePolicy,
        ramp_up: Option<&mut RampUpFilter>,
        known_errors: &mut ErrorRegistry,
        mut sample: Sample,
    ) -> Option<ClassifiedSample> {
        if sample.response_time < 0.0 {
            warn!(
                "negative response time reported for label {:?}: {}",
                sample.label, sample.response_time
            );
            sample.response_time = 0.0;
        }
        if sample.connect_time < 0.0 {
            sample.connect_time = 0.0;
        }
        if sample.latency < 0.0 {
            sample.latency = 0.0;
        }
        if let Some(filter) = ramp_up {
            if filter.excludes(&sample.label, sample.timestamp) {
                return None;
            }
        }
        let kind = policy.classify(&sample.response_code, sample.error.as_deref());
        let track_error = kind.is_failure() && {
            let message = sample
                .error
                .as_deref()
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", sample.response_code));
            known_errors.admit(&message)
        };
        if settings.extend_aggregation && !sample.label.is_empty() {
            sample.label = format!("{}{}", sample.label, kind.label_suffix());
        }
        Some(ClassifiedSample {
            sample,
            kind,
            track_error,
        })
    }

    /// Rewrite the finished second's labels through the generalizer and
    /// apply any resulting bucket merges to the cumulative map. Runs before
    /// the second is folded into cumulative, so admissions are judged
    /// against the current bucket set.
    fn apply_generalization(&mut self, point: &mut DataPoint) {
        let generalizer = match self.generalizer.as_mut() {
            Some(g) => g,
            None => return,
        };
        let mut known: Vec<String> = self
            .cumulative
            .keys()
            .filter(|k| !k.is_empty())
            .cloned()
            .collect();
        let labels: Vec<String> = point
            .current
            .keys()
            .filter(|k| !k.is_empty())
            .cloned()
            .collect();
        for label in labels {
            match generalizer.assign(&label, &known) {
                Assignment::Keep => {
                    if !known.contains(&label) {
                        known.push(label);
                    }
                }
                Assignment::MapTo(bucket) => {
                    rename_bucket(&mut point.current, &label, &bucket);
                }
                Assignment::Regroup { bucket, absorb } => {
                    rename_bucket(&mut point.current, &label, &bucket);
                    for old in &absorb {
                        rename_bucket(&mut self.cumulative, old, &bucket);
                        rename_bucket(&mut point.current, old, &bucket);
                        known.retain(|k| k != old);
                    }
                    if !known.contains(&bucket) {
                        known.push(bucket);
                    }
                }
            }
        }
    }
}

/// Move `from` into `to`, folding the statistics together when the target
/// bucket already exists.
fn rename_bucket(map: &mut BTreeMap<String, KPISet>, from: &str, to: &str) {
    if from == to {
        return;
    }
    if let Some(kpi) = map.remove(from) {
        match map.get_mut(to) {
            Some(existing) => existing.accumulate(&kpi),
            None => {
                map.insert(to.to_string(), kpi);
            }
        }
    }
}
