//! Per-location latency bookkeeping used to rank race candidates.

use cachet_core::LocationId;
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, Default)]
struct RunningMean {
    mean: f64,
    samples: u64,
}

impl RunningMean {
    fn push(&mut self, sample: f64) {
        self.samples += 1;
        self.mean += (sample - self.mean) / self.samples as f64;
    }
}

/// Mean normalized latency per location, in milliseconds per byte.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    means: DashMap<LocationId, RunningMean>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful fetch. Sizes below one byte count as one.
    pub fn record(&self, location: &LocationId, latency_ms: f64, serialized_size: u64) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        let normalized = latency_ms / serialized_size.max(1) as f64;
        self.means.entry(location.clone()).or_default().push(normalized);
    }

    pub fn forget(&self, location: &LocationId) {
        self.means.remove(location);
    }

    pub fn mean(&self, location: &LocationId) -> Option<f64> {
        self.means.get(location).map(|m| m.mean)
    }

    /// Sort ids fastest first. Unknown locations rank last, ties keep
    /// their input order.
    pub fn rank(&self, ids: &[LocationId]) -> Vec<LocationId> {
        let mut scored: Vec<(f64, &LocationId)> = ids
            .iter()
            .map(|id| (self.mean(id).unwrap_or(f64::INFINITY), id))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.into_iter().map(|(_, id)| id.clone()).collect()
    }
}
