//! Result output.
//!
//! The consolidation core only guarantees ordered delivery; turning the
//! stream into files is listener work and lives here. The writer streams
//! one JSON object per consolidated second and, when the run finalizes,
//! writes a separate summary document with the run-wide cumulative
//! statistics.

use crate::datapoint::DataPoint;
use crate::kpiset::KPISet;
use crate::listener::Listener;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Streams consolidated seconds as JSON lines and optionally writes a final
/// summary document.
pub struct JsonResultsWriter {
    stream_path: PathBuf,
    stream: BufWriter<File>,
    summary_path: Option<PathBuf>,
    seconds_delivered: usize,
    last_cumulative: BTreeMap<String, KPISet>,
}

/// Final summary document layout.
#[derive(Serialize)]
struct RunSummary<'a> {
    metadata: SummaryMetadata,
    cumulative: &'a BTreeMap<String, KPISet>,
}

#[derive(Serialize)]
struct SummaryMetadata {
    version: String,
    generated_at: chrono::DateTime<chrono::Utc>,
    seconds_delivered: usize,
}

impl JsonResultsWriter {
    /// Create the writer, truncating any existing stream file.
    pub fn new(stream_path: impl AsRef<Path>) -> Result<Self> {
        let stream_path = stream_path.as_ref().to_path_buf();
        let file = File::create(&stream_path)
            .with_context(|| format!("failed to create results stream {:?}", stream_path))?;
        debug!("streaming consolidated seconds to {:?}", stream_path);
        Ok(Self {
            stream_path,
            stream: BufWriter::new(file),
            summary_path: None,
            seconds_delivered: 0,
            last_cumulative: BTreeMap::new(),
        })
    }

    /// Also write a cumulative summary document when the run finalizes.
    pub fn with_summary(mut self, summary_path: impl AsRef<Path>) -> Self {
        self.summary_path = Some(summary_path.as_ref().to_path_buf());
        self
    }

    pub fn seconds_delivered(&self) -> usize {
        self.seconds_delivered
    }

    fn write_summary(&self) -> Result<()> {
        let summary_path = match &self.summary_path {
            Some(path) => path,
            None => return Ok(()),
        };
        let summary = RunSummary {
            metadata: SummaryMetadata {
                version: crate::VERSION.to_string(),
                generated_at: chrono::Utc::now(),
                seconds_delivered: self.seconds_delivered,
            },
            cumulative: &self.last_cumulative,
        };
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(summary_path, json)
            .with_context(|| format!("failed to write summary {:?}", summary_path))?;
        info!("results summary written to {:?}", summary_path);
        Ok(())
    }
}

impl Listener for JsonResultsWriter {
    fn aggregated_second(&mut self, point: &DataPoint) {
        // The listener contract is infallible; a failed write is logged and
        // the stream keeps going.
        match serde_json::to_string(point) {
            Ok(line) => {
                if let Err(err) = writeln!(self.stream, "{}", line) {
                    warn!(
                        "failed to stream second {} to {:?}: {}",
                        point.timestamp, self.stream_path, err
                    );
                }
            }
            Err(err) => warn!("failed to serialize second {}: {}", point.timestamp, err),
        }
        self.seconds_delivered += 1;
        self.last_cumulative = point.cumulative.clone();
    }

    fn finalize(&mut self) -> Result<()> {
        self.stream
            .flush()
            .with_context(|| format!("failed to flush results stream {:?}", self.stream_path))?;
        self.write_summary()
    }
}
