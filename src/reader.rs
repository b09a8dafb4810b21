//! Sample sources.
//!
//! Executors (or their log parsers) feed the engine through the [`Reader`]
//! contract: a non-blocking poll that yields whatever raw samples have
//! become available, in non-decreasing timestamp order, plus a way to say
//! the stream is permanently finished. [`ReplayReader`] adapts a recorded
//! sample vector to that contract; real adapters live with the executors.
//!
//! The per-source reorder buffer that turns raw samples into per-second
//! [`DataPoint`]s also lives here. It holds a source's newest seconds back
//! until they are unlikely to receive further samples, scaling the holdback
//! with observed response times: slow endpoints report late.

use crate::datapoint::DataPoint;
use crate::histogram::RespTimeHistogram;
use crate::kpiset::{FailureKind, KPISet};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One raw request sample as produced by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Wall-clock second the request finished in.
    pub timestamp: u64,
    pub label: String,
    /// Virtual users active in the producing executor at this moment.
    pub concurrency: u64,
    /// Full response time, seconds.
    pub response_time: f64,
    /// Connect time, seconds.
    pub connect_time: f64,
    /// First-byte latency, seconds.
    pub latency: f64,
    pub response_code: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub transaction: String,
    #[serde(default)]
    pub byte_count: u64,
}

impl Sample {
    /// Convenience constructor for the common case: one successful request
    /// with code 200 and a single virtual user. Builder-style methods fill
    /// in the rest.
    pub fn new(timestamp: u64, label: impl Into<String>, response_time: f64) -> Self {
        Self {
            timestamp,
            label: label.into(),
            concurrency: 1,
            response_time,
            connect_time: 0.0,
            latency: 0.0,
            response_code: "200".to_string(),
            error: None,
            transaction: String::new(),
            byte_count: 0,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.response_code = code.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: u64) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_bytes(mut self, byte_count: u64) -> Self {
        self.byte_count = byte_count;
        self
    }
}

/// Contract implemented by every sample source.
///
/// `poll` must never block: a source with nothing new returns an empty
/// vector and tolerates being polled again. Timestamps are non-decreasing
/// across successive polls of one reader.
pub trait Reader: Send {
    fn poll(&mut self) -> Result<Vec<Sample>>;

    /// True once the source will never produce another sample.
    fn is_finished(&self) -> bool;
}

/// Replays a pre-recorded sample vector, optionally in fixed-size chunks to
/// mimic a source that trickles data in.
pub struct ReplayReader {
    samples: Vec<Sample>,
    cursor: usize,
    chunk_size: Option<usize>,
}

impl ReplayReader {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            cursor: 0,
            chunk_size: None,
        }
    }

    /// Release at most `chunk_size` samples per poll instead of everything
    /// at once.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }

    /// Load samples from a JSON-lines file, one serialized [`Sample`] per
    /// line.
    pub fn from_json_lines(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open sample file {:?}", path))?;
        let mut samples = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("failed to read {:?}", path))?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: Sample = serde_json::from_str(&line)
                .with_context(|| format!("malformed sample at {:?}:{}", path, number + 1))?;
            samples.push(sample);
        }
        Ok(Self::new(samples))
    }
}

impl Reader for ReplayReader {
    fn poll(&mut self) -> Result<Vec<Sample>> {
        if self.cursor >= self.samples.len() {
            return Ok(Vec::new());
        }
        let end = match self.chunk_size {
            Some(chunk) => (self.cursor + chunk).min(self.samples.len()),
            None => self.samples.len(),
        };
        let batch = self.samples[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(batch)
    }

    fn is_finished(&self) -> bool {
        self.cursor >= self.samples.len()
    }
}

/// A sample that already went through repair, ramp-up filtering and failure
/// classification.
#[derive(Debug, Clone)]
pub(crate) struct ClassifiedSample {
    pub sample: Sample,
    pub kind: FailureKind,
    /// Whether the error registry admitted this sample's message.
    pub track_error: bool,
}

/// Per-source reorder buffer: groups classified samples by second and
/// releases seconds once they trail the newest observed second by the
/// adaptive buffer depth.
pub(crate) struct ReaderBuffer {
    pending: BTreeMap<u64, Vec<ClassifiedSample>>,
    max_seen: Option<u64>,
    cumulative: BTreeMap<String, KPISet>,
    rt_probe: RespTimeHistogram,
    min_buffer_len: usize,
    buffer_multiplier: f64,
    buffer_scale: f64,
    histogram_high_ms: u64,
}

impl ReaderBuffer {
    pub fn new(
        min_buffer_len: usize,
        buffer_multiplier: f64,
        buffer_scale: f64,
        histogram_high_ms: u64,
    ) -> Self {
        Self {
            pending: BTreeMap::new(),
            max_seen: None,
            cumulative: BTreeMap::new(),
            rt_probe: RespTimeHistogram::new(histogram_high_ms),
            min_buffer_len,
            buffer_multiplier,
            buffer_scale,
            histogram_high_ms,
        }
    }

    pub fn ingest(&mut self, classified: ClassifiedSample) {
        let ts = classified.sample.timestamp;
        self.rt_probe
            .record((classified.sample.response_time * 1000.0).round() as u64);
        self.max_seen = Some(self.max_seen.map_or(ts, |m| m.max(ts)));
        self.pending.entry(ts).or_default().push(classified);
    }

    /// Seconds to hold back: at least `min_buffer_len`, scaled up when the
    /// source's response times exceed a second.
    fn buffer_len(&self) -> u64 {
        let scaled_rt = self.rt_probe.quantile(self.buffer_scale) / 1000.0;
        let adaptive = (scaled_rt * self.buffer_multiplier).ceil() as u64;
        adaptive.max(self.min_buffer_len as u64)
    }

    /// Drain every second that is safe to release, oldest first. A final
    /// drain releases everything.
    pub fn drain(&mut self, is_final: bool) -> Vec<DataPoint> {
        let cutoff = if is_final {
            u64::MAX
        } else {
            match self.max_seen {
                Some(max) => max.saturating_sub(self.buffer_len()),
                None => return Vec::new(),
            }
        };
        let ready: Vec<u64> = self
            .pending
            .range(..=cutoff)
            .map(|(&ts, _)| ts)
            .collect();
        let mut points = Vec::with_capacity(ready.len());
        for ts in ready {
            if let Some(samples) = self.pending.remove(&ts) {
                points.push(self.build_point(ts, samples));
            }
        }
        points
    }

    fn build_point(&mut self, ts: u64, samples: Vec<ClassifiedSample>) -> DataPoint {
        let mut point = DataPoint::new(ts);
        for classified in &samples {
            point
                .current
                .entry(classified.sample.label.clone())
                .or_insert_with(|| KPISet::new(self.histogram_high_ms))
                .add_sample(&classified.sample, classified.kind, classified.track_error);
        }
        point.recalculate_overall();
        for (label, kpi) in &point.current {
            self.cumulative
                .entry(label.clone())
                .or_insert_with(|| KPISet::new(self.histogram_high_ms))
                .accumulate(kpi);
        }
        point.cumulative = self.cumulative.clone();
        point
    }

    pub fn cumulative(&self) -> &BTreeMap<String, KPISet> {
        &self.cumulative
    }
}
