use std::sync::atomic::{AtomicU64, Ordering};

use super::{MeasurementKind, MAX_MEASUREMENT_KIND};

/// Counts of accepted and rejected measurements since the last report,
/// one slot per [`MeasurementKind`]. Shared by every ingesting thread.
pub struct IngestStats {
    counts: [AtomicU64; MAX_MEASUREMENT_KIND + 1],
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, kind: MeasurementKind) {
        self.record_n(kind, 1);
    }

    /// Adds `n` measurements of one kind.
    pub fn record_n(&self, kind: MeasurementKind, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Drains the counters. Kinds with nothing recorded since the previous
    /// drain are left out.
    pub fn snapshot(&self) -> Vec<(MeasurementKind, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = MeasurementKind::from_u8(i as u8) {
                    result.push((kind, v));
                }
            }
        }

        result
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IngestStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        f.debug_struct("IngestStats").field("counts", &counts).finish()
    }
}
