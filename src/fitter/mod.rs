//! Fitter seam.
//!
//! The monitor treats beam and vertex fitting as opaque services: a fitter
//! receives the raw measurements accumulated over a window (or a whole run)
//! and either returns a beam spot or reports why it could not.

pub mod d0phi;
pub mod vertex;

use std::sync::Arc;

use thiserror::Error;

use crate::beamspot::{BeamSpot, Variant};
use crate::config::FitterConfig;
use crate::event::{TrackRecord, VertexSample};

pub use self::d0phi::D0PhiFitter;
pub use self::vertex::WeightedVertexFitter;

/// Raw measurements handed to a fitter.
#[derive(Debug, Clone, Copy)]
pub struct FitInput<'a> {
    pub vertices: &'a [VertexSample],
    pub tracks: &'a [TrackRecord],
}

/// Reasons a fitter produced no beam spot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("insufficient data: need {needed}, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("normal equations are singular")]
    Singular,

    #[error("fit result is not finite")]
    NonFinite,
}

/// A beam spot estimation service.
pub trait FitterPort: Send + Sync {
    /// The variant this fitter's results are recorded under.
    fn variant(&self) -> Variant;

    /// Fit the given measurements. Must not retain references to the input.
    fn fit(&self, input: &FitInput<'_>) -> Result<BeamSpot, FitError>;
}

/// The two fitters run at every window close, plus the fitter used for the
/// run-wide pooled vertex estimate.
#[derive(Clone)]
pub struct FitterSet {
    pub beam: Arc<dyn FitterPort>,
    pub vertex: Arc<dyn FitterPort>,
    pub pooled: Arc<dyn FitterPort>,
}

impl FitterSet {
    /// Builds the reference fitters from configuration.
    pub fn from_config(cfg: &FitterConfig) -> Self {
        Self {
            beam: Arc::new(D0PhiFitter::new(cfg.min_tracks, cfg.max_track_d0)),
            vertex: Arc::new(WeightedVertexFitter::new(
                Variant::VertexFit,
                cfg.min_vertices,
            )),
            pooled: Arc::new(WeightedVertexFitter::new(
                Variant::PooledVertices,
                cfg.min_vertices,
            )),
        }
    }
}

impl std::fmt::Debug for FitterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitterSet")
            .field("beam", &self.beam.variant())
            .field("vertex", &self.vertex.variant())
            .field("pooled", &self.pooled.variant())
            .finish()
    }
}

/// Inverts a small symmetric matrix by Gauss-Jordan elimination with partial
/// pivoting. Returns `None` when a pivot falls below `1e-12` of the largest
/// matrix element.
pub(crate) fn invert<const N: usize>(m: [[f64; N]; N]) -> Option<[[f64; N]; N]> {
    let mut a = m;
    let mut inv = [[0.0; N]; N];
    for (i, row) in inv.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    let scale = m.iter().flatten().map(|v| v.abs()).fold(0.0, f64::max);
    if scale <= 0.0 || !scale.is_finite() {
        return None;
    }
    let tolerance = scale * 1e-12;

    for col in 0..N {
        let pivot = (col..N)
            .max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() <= tolerance {
            return None;
        }
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let p = a[col][col];
        for k in 0..N {
            a[col][k] /= p;
            inv[col][k] /= p;
        }

        for row in 0..N {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for k in 0..N {
                a[row][k] -= factor * a[col][k];
                inv[row][k] -= factor * inv[col][k];
            }
        }
    }

    Some(inv)
}
