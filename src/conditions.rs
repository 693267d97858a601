//! Calibration-record lookup.

use std::collections::BTreeMap;

use crate::beamspot::BeamSpot;
use crate::config::ConditionsEntry;
use crate::monitor::window::WindowId;

/// Source of the calibration-record beam spot for a window.
pub trait ConditionsSource: Send + Sync {
    /// Returns `None` when no record covers the window.
    fn beam_spot(&self, window: WindowId) -> Option<BeamSpot>;
}

/// Interval-of-validity table: each entry applies from its first window up
/// to, not including, the next entry of the same run.
#[derive(Debug, Clone, Default)]
pub struct IovConditions {
    entries: BTreeMap<WindowId, BeamSpot>,
}

impl IovConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[ConditionsEntry]) -> Self {
        let mut iov = Self::new();
        for e in entries {
            iov.insert(WindowId::new(e.run, e.first_window), e.beam_spot);
        }
        iov
    }

    pub fn insert(&mut self, since: WindowId, beam_spot: BeamSpot) {
        self.entries.insert(since, beam_spot);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConditionsSource for IovConditions {
    fn beam_spot(&self, window: WindowId) -> Option<BeamSpot> {
        self.entries
            .range(..=window)
            .next_back()
            .filter(|(since, _)| since.run == window.run)
            .map(|(_, bs)| *bs)
    }
}
