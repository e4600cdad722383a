//! Latest-sample view and bounded history over the agent's sensor reports.

use std::collections::VecDeque;

use solarflow_client::{
    db::{codec, Record},
    domain::{TelemetrySample, SENSOR_COLLECTION},
};
use time::{Duration, OffsetDateTime};

use crate::pipeline::{PipelineError, Reconcile};

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// `now - sample.timestamp < threshold`. Samples stamped in the future count
/// as live.
pub fn is_live(sample: &TelemetrySample, now: OffsetDateTime, threshold: Duration) -> bool {
    now - sample.timestamp < threshold
}

#[derive(Debug, Clone)]
pub struct TelemetryReconciler {
    latest: Option<TelemetrySample>,
    /// Newest first, by capture timestamp.
    history: VecDeque<TelemetrySample>,
    capacity: usize,
}

impl Default for TelemetryReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl TelemetryReconciler {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            latest: None,
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn latest(&self) -> Option<&TelemetrySample> {
        self.latest.as_ref()
    }

    pub fn history_newest_first(&self) -> impl Iterator<Item = &TelemetrySample> {
        self.history.iter()
    }

    /// Oldest first, as charts consume it.
    pub fn history_oldest_first(&self) -> impl Iterator<Item = &TelemetrySample> {
        self.history.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Admit a sample. Re-deliveries of a sample already held (same record id)
    /// are ignored. Returns whether the view changed.
    pub fn admit(&mut self, sample: TelemetrySample) -> bool {
        if !sample.id.is_empty() && self.history.iter().any(|s| s.id == sample.id) {
            return false;
        }

        let newer = self
            .latest
            .as_ref()
            .map_or(true, |current| sample.timestamp > current.timestamp);
        if newer {
            self.latest = Some(sample.clone());
        }

        let pos = self
            .history
            .iter()
            .position(|s| s.timestamp < sample.timestamp)
            .unwrap_or(self.history.len());
        self.history.insert(pos, sample);
        while self.history.len() > self.capacity {
            self.history.pop_back();
        }
        true
    }
}

impl Reconcile for TelemetryReconciler {
    fn reconcile(&mut self, record: &Record) -> Result<bool, PipelineError> {
        if record.key.collection != SENSOR_COLLECTION {
            return Ok(false);
        }
        let mut sample: TelemetrySample =
            codec::decode_record(record).map_err(|e| PipelineError::Decode(e.to_string()))?;
        sample.id = record.key.id.clone();
        metrics::counter!("telemetry_samples_total").increment(1);
        Ok(self.admit(sample))
    }
}
