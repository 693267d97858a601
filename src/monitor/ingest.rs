use std::sync::Arc;

use tracing::debug;

use crate::event::stats::IngestStats;
use crate::event::{EventRecord, MeasurementKind, VertexSample};

use super::cache::WindowHandle;
use super::error::Result;
use super::histogram::TrackDiagnostics;
use super::window::WindowAccumulator;

/// What one event contributed to its window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub accepted_vertices: usize,
    pub rejected_vertices: usize,
    pub accepted_tracks: usize,
    pub rejected_tracks: usize,
    pub scaler_recorded: bool,
    pub conditions_recorded: bool,
    pub rejected_readings: usize,
}

/// Routes event records into the accumulator of their window.
///
/// Malformed measurements are dropped and counted; they never fail the
/// event. The only error is ingesting into a window that already closed.
pub struct EventIngestor {
    stats: Arc<IngestStats>,
}

impl EventIngestor {
    pub fn new(stats: Arc<IngestStats>) -> Self {
        Self { stats }
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    pub fn ingest(
        &self,
        handle: &WindowHandle,
        event: &EventRecord,
        diagnostics: Option<&TrackDiagnostics>,
    ) -> Result<IngestOutcome> {
        let outcome = handle.with_accumulator(|acc| apply(acc, event, diagnostics))?;

        if outcome.rejected_vertices > 0 || outcome.rejected_readings > 0 {
            debug!(
                window = %handle.id(),
                rejected_vertices = outcome.rejected_vertices,
                rejected_readings = outcome.rejected_readings,
                "dropped malformed measurements",
            );
        }

        self.stats.record(MeasurementKind::Event);
        self.stats
            .record_n(MeasurementKind::Vertex, outcome.accepted_vertices as u64);
        self.stats.record_n(
            MeasurementKind::RejectedVertex,
            outcome.rejected_vertices as u64,
        );
        self.stats
            .record_n(MeasurementKind::Track, outcome.accepted_tracks as u64);
        self.stats.record_n(
            MeasurementKind::RejectedTrack,
            outcome.rejected_tracks as u64,
        );
        if outcome.scaler_recorded {
            self.stats.record(MeasurementKind::Scaler);
        }
        if outcome.conditions_recorded {
            self.stats.record(MeasurementKind::Conditions);
        }
        self.stats.record_n(
            MeasurementKind::RejectedReading,
            outcome.rejected_readings as u64,
        );

        Ok(outcome)
    }
}

fn apply(
    acc: &mut WindowAccumulator,
    event: &EventRecord,
    diagnostics: Option<&TrackDiagnostics>,
) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();

    acc.counters.events += 1;

    for vertex in &event.vertices {
        if vertex.is_accepted() {
            acc.vertex_samples.push(VertexSample::from(vertex));
            outcome.accepted_vertices += 1;
        } else {
            outcome.rejected_vertices += 1;
        }
    }

    // Last value wins within a window.
    if let Some(reading) = event.scaler {
        if reading.is_well_formed() {
            acc.scaler = Some(reading);
            outcome.scaler_recorded = true;
        } else {
            outcome.rejected_readings += 1;
        }
    }
    if let Some(reading) = event.conditions {
        if reading.is_well_formed() {
            acc.conditions = Some(reading);
            outcome.conditions_recorded = true;
        } else {
            outcome.rejected_readings += 1;
        }
    }

    for track in &event.tracks {
        if track.is_accepted() {
            if let Some(diag) = diagnostics {
                diag.record(track, acc.conditions.as_ref());
            }
            acc.tracks.push(*track);
            outcome.accepted_tracks += 1;
        } else {
            outcome.rejected_tracks += 1;
        }
    }

    acc.counters.vertices += outcome.accepted_vertices as u64;
    acc.counters.rejected_vertices += outcome.rejected_vertices as u64;
    acc.counters.tracks += outcome.accepted_tracks as u64;
    acc.counters.rejected_tracks += outcome.rejected_tracks as u64;

    outcome
}
