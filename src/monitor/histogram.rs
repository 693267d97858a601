use std::f64::consts::{PI, TAU};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::beamspot::BeamSpot;
use crate::config::TrackDiagnosticsConfig;
use crate::event::TrackRecord;

/// Fixed-width histogram over `[-range, range)` with underflow and overflow
/// counters. All operations are atomic and safe for concurrent use.
pub struct LinearHistogram {
    range: f64,
    bins: Vec<AtomicU64>,
    underflow: AtomicU64,
    overflow: AtomicU64,
}

impl LinearHistogram {
    pub fn new(bins: usize, range: f64) -> Self {
        Self {
            range,
            bins: (0..bins.max(1)).map(|_| AtomicU64::new(0)).collect(),
            underflow: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value: f64) {
        match bin_index(value, -self.range, self.range, self.bins.len()) {
            BinIndex::Under => self.underflow.fetch_add(1, Ordering::Relaxed),
            BinIndex::Over => self.overflow.fetch_add(1, Ordering::Relaxed),
            BinIndex::Bin(i) => self.bins[i].fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            low: -self.range,
            high: self.range,
            counts: self
                .bins
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            underflow: self.underflow.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for LinearHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearHistogram")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Point-in-time view of a [`LinearHistogram`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub low: f64,
    pub high: f64,
    pub counts: Vec<u64>,
    pub underflow: u64,
    pub overflow: u64,
}

impl HistogramSnapshot {
    pub fn entries(&self) -> u64 {
        self.counts.iter().sum::<u64>() + self.underflow + self.overflow
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ProfileBin {
    sum: f64,
    sum_sq: f64,
    n: u64,
}

/// Mean of a quantity in bins of phi over `[-pi, pi)`.
pub struct PhiProfile {
    bins: Mutex<Vec<ProfileBin>>,
}

impl PhiProfile {
    pub fn new(bins: usize) -> Self {
        Self {
            bins: Mutex::new(vec![ProfileBin::default(); bins.max(1)]),
        }
    }

    pub fn record(&self, phi: f64, value: f64) {
        let wrapped = (phi + PI).rem_euclid(TAU) - PI;
        let mut bins = self.bins.lock();
        let len = bins.len();
        if let BinIndex::Bin(i) = bin_index(wrapped, -PI, PI, len) {
            let bin = &mut bins[i];
            bin.sum += value;
            bin.sum_sq += value * value;
            bin.n += 1;
        }
    }

    pub fn snapshot(&self) -> Vec<ProfilePoint> {
        let bins = self.bins.lock();
        let width = TAU / bins.len() as f64;
        bins.iter()
            .enumerate()
            .map(|(i, b)| {
                let center = -PI + (i as f64 + 0.5) * width;
                if b.n == 0 {
                    return ProfilePoint {
                        phi: center,
                        mean: 0.0,
                        error: 0.0,
                        entries: 0,
                    };
                }
                let n = b.n as f64;
                let mean = b.sum / n;
                let variance = (b.sum_sq / n - mean * mean).max(0.0);
                ProfilePoint {
                    phi: center,
                    mean,
                    error: (variance / n).sqrt(),
                    entries: b.n,
                }
            })
            .collect()
    }
}

/// One bin of a [`PhiProfile`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfilePoint {
    pub phi: f64,
    pub mean: f64,
    pub error: f64,
    pub entries: u64,
}

/// Per-run track diagnostics: d0 vs phi0, and the transverse impact
/// parameter relative to the window's calibration-record beam spot.
pub struct TrackDiagnostics {
    d0_phi0: PhiProfile,
    dxy: LinearHistogram,
}

impl TrackDiagnostics {
    pub fn new(cfg: &TrackDiagnosticsConfig) -> Self {
        Self {
            d0_phi0: PhiProfile::new(cfg.phi_bins),
            dxy: LinearHistogram::new(cfg.dxy_bins, cfg.dxy_range),
        }
    }

    pub fn record(&self, track: &TrackRecord, reference: Option<&BeamSpot>) {
        self.d0_phi0.record(track.phi0, track.d0);
        if let Some(bs) = reference {
            self.dxy.record(track.dxy(bs));
        }
    }

    pub fn snapshot(&self) -> TrackDiagnosticsSnapshot {
        TrackDiagnosticsSnapshot {
            d0_phi0: self.d0_phi0.snapshot(),
            dxy: self.dxy.snapshot(),
        }
    }
}

/// Serializable view of [`TrackDiagnostics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackDiagnosticsSnapshot {
    pub d0_phi0: Vec<ProfilePoint>,
    pub dxy: HistogramSnapshot,
}

#[derive(Debug, PartialEq, Eq)]
enum BinIndex {
    Under,
    Over,
    Bin(usize),
}

fn bin_index(value: f64, low: f64, high: f64, bins: usize) -> BinIndex {
    if value.is_nan() || value < low {
        return BinIndex::Under;
    }
    if value >= high {
        return BinIndex::Over;
    }
    let i = ((value - low) / (high - low) * bins as f64) as usize;
    BinIndex::Bin(i.min(bins - 1))
}
