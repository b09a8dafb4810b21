//! Consumers of consolidated seconds.

use crate::datapoint::DataPoint;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// Contract implemented by every downstream consumer (reporters, uploaders,
/// pass/fail evaluators).
///
/// `aggregated_second` is invoked exactly once per finished second, in
/// strictly increasing timestamp order, and is never re-delivered for the
/// same timestamp.
pub trait Listener: Send {
    fn aggregated_second(&mut self, point: &DataPoint);

    /// Called once after the final second has been delivered. Writers flush
    /// and close here.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Listener that records every delivered point behind a shared mutex, so a
/// test (or another thread) can inspect the stream while the aggregation
/// loop keeps running.
#[derive(Clone, Default)]
pub struct RecordingListener {
    points: Arc<Mutex<Vec<DataPoint>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything delivered so far.
    pub fn points(&self) -> Vec<DataPoint> {
        self.points.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }

    pub fn last(&self) -> Option<DataPoint> {
        self.points.lock().last().cloned()
    }
}

impl Listener for RecordingListener {
    fn aggregated_second(&mut self, point: &DataPoint) {
        self.points.lock().push(point.clone());
    }
}
