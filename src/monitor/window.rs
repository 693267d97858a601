use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::beamspot::{BeamSpot, Variant};
use crate::event::{TrackRecord, VertexSample};

/// Identifies a luminosity window inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WindowId {
    pub run: u32,
    pub window: u32,
}

impl WindowId {
    pub const fn new(run: u32, window: u32) -> Self {
        Self { run, window }
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.run, self.window)
    }
}

/// Measurement counters kept per window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounters {
    pub events: u64,
    pub vertices: u64,
    pub rejected_vertices: u64,
    pub tracks: u64,
    pub rejected_tracks: u64,
}

/// Mutable accumulation state of an open window. This is also the running
/// state the fitters consume at close.
#[derive(Debug, Default)]
pub struct WindowAccumulator {
    pub counters: WindowCounters,
    pub vertex_samples: Vec<VertexSample>,
    pub tracks: Vec<TrackRecord>,
    pub scaler: Option<BeamSpot>,
    pub conditions: Option<BeamSpot>,
}

/// Frozen result of one window. Written once at close, shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSnapshot {
    pub id: WindowId,
    pub beam_spots: BTreeMap<Variant, BeamSpot>,
    pub vertex_samples: Vec<VertexSample>,
    pub counters: WindowCounters,
}

impl WindowSnapshot {
    pub fn beam_spot(&self, variant: Variant) -> Option<&BeamSpot> {
        self.beam_spots.get(&variant)
    }

    pub fn has(&self, variant: Variant) -> bool {
        self.beam_spots.contains_key(&variant)
    }
}
