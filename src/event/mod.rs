pub mod stats;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::beamspot::{BeamSpot, Measurement};

/// A reconstructed primary vertex as delivered by the event source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VertexRecord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub x_error: f64,
    pub y_error: f64,
    pub z_error: f64,
    /// Number of tracks attached to the vertex.
    #[serde(default)]
    pub tracks: u32,
}

impl VertexRecord {
    /// Minimal quality filter: finite coordinates and strictly positive,
    /// finite errors.
    pub fn is_accepted(&self) -> bool {
        let coords = [self.x, self.y, self.z];
        let errors = [self.x_error, self.y_error, self.z_error];
        coords.iter().all(|c| c.is_finite()) && errors.iter().all(|e| e.is_finite() && *e > 0.0)
    }
}

/// A reconstructed track, reduced to the perigee parameters the fitters use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    /// Transverse impact parameter with respect to the origin.
    pub d0: f64,
    /// Azimuth at the point of closest approach.
    pub phi0: f64,
    /// Longitudinal impact parameter.
    pub z0: f64,
    pub d0_error: f64,
    #[serde(default)]
    pub pt: f64,
}

impl TrackRecord {
    pub fn is_accepted(&self) -> bool {
        self.d0.is_finite()
            && self.phi0.is_finite()
            && self.z0.is_finite()
            && self.d0_error.is_finite()
            && self.d0_error > 0.0
    }

    /// Transverse impact parameter relative to a reference beam position.
    pub fn dxy(&self, beam_spot: &BeamSpot) -> f64 {
        self.d0 - (-beam_spot.x.value * self.phi0.sin() + beam_spot.y.value * self.phi0.cos())
    }
}

/// Everything one event contributes to its window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default)]
    pub vertices: Vec<VertexRecord>,
    #[serde(default)]
    pub tracks: Vec<TrackRecord>,
    /// Independent online beam spot reading.
    #[serde(default)]
    pub scaler: Option<BeamSpot>,
    /// Calibration-record beam spot attached to the event.
    #[serde(default)]
    pub conditions: Option<BeamSpot>,
}

/// Position-and-error triple of an accepted primary vertex.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VertexSample {
    pub data: [Measurement; 3],
}

impl VertexSample {
    pub fn x(&self) -> Measurement {
        self.data[0]
    }

    pub fn y(&self) -> Measurement {
        self.data[1]
    }

    pub fn z(&self) -> Measurement {
        self.data[2]
    }
}

impl From<&VertexRecord> for VertexSample {
    fn from(v: &VertexRecord) -> Self {
        Self {
            data: [
                Measurement::new(v.x, v.x_error),
                Measurement::new(v.y, v.y_error),
                Measurement::new(v.z, v.z_error),
            ],
        }
    }
}

/// Kinds of measurements counted at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MeasurementKind {
    Event = 0,
    Vertex = 1,
    RejectedVertex = 2,
    Track = 3,
    RejectedTrack = 4,
    Scaler = 5,
    Conditions = 6,
    RejectedReading = 7,
}

/// Maximum MeasurementKind value, used for array sizing.
pub const MAX_MEASUREMENT_KIND: usize = 7;

impl MeasurementKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Vertex => "vertex",
            Self::RejectedVertex => "rejected_vertex",
            Self::Track => "track",
            Self::RejectedTrack => "rejected_track",
            Self::Scaler => "scaler",
            Self::Conditions => "conditions",
            Self::RejectedReading => "rejected_reading",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Event),
            1 => Some(Self::Vertex),
            2 => Some(Self::RejectedVertex),
            3 => Some(Self::Track),
            4 => Some(Self::RejectedTrack),
            5 => Some(Self::Scaler),
            6 => Some(Self::Conditions),
            7 => Some(Self::RejectedReading),
            _ => None,
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
