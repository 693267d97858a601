use crate::beamspot::{BeamSpot, Measurement, Variant};
use crate::event::TrackRecord;

use super::{invert, FitError, FitInput, FitterPort};

/// Track-based beam fit using the d0-phi0 correlation.
///
/// For a track emerging from the beam line at transverse position
/// `(x0 + dxdz*z0, y0 + dydz*z0)`, the impact parameter with respect to the
/// origin is `d0 = -(x0 + dxdz*z0)*sin(phi0) + (y0 + dydz*z0)*cos(phi0)`.
/// The four beam-line parameters are solved by weighted linear least squares.
/// When the z0 lever arm is too short for the slopes, the fit falls back to
/// the two-parameter form and reports zero slopes.
#[derive(Debug, Clone)]
pub struct D0PhiFitter {
    min_tracks: usize,
    max_d0: f64,
}

impl D0PhiFitter {
    pub fn new(min_tracks: usize, max_d0: f64) -> Self {
        Self {
            min_tracks: min_tracks.max(4),
            max_d0,
        }
    }
}

impl FitterPort for D0PhiFitter {
    fn variant(&self) -> Variant {
        Variant::Fit
    }

    fn fit(&self, input: &FitInput<'_>) -> Result<BeamSpot, FitError> {
        let tracks: Vec<&TrackRecord> = input
            .tracks
            .iter()
            .filter(|t| t.is_accepted() && t.d0.abs() <= self.max_d0)
            .collect();

        if tracks.len() < self.min_tracks {
            return Err(FitError::InsufficientData {
                needed: self.min_tracks,
                available: tracks.len(),
            });
        }

        let (params, errors) = match solve(&tracks, |t| {
            let (s, c) = t.phi0.sin_cos();
            [-s, c, -s * t.z0, c * t.z0]
        }) {
            Some(full) => full,
            None => {
                let (p, e) = solve(&tracks, |t| {
                    let (s, c) = t.phi0.sin_cos();
                    [-s, c]
                })
                .ok_or(FitError::Singular)?;
                ([p[0], p[1], 0.0, 0.0], [e[0], e[1], 0.0, 0.0])
            }
        };

        let n = tracks.len() as f64;

        let mut residual_sq = 0.0;
        let mut error_sq = 0.0;
        for t in &tracks {
            let (s, c) = t.phi0.sin_cos();
            let predicted =
                -s * (params[0] + params[2] * t.z0) + c * (params[1] + params[3] * t.z0);
            residual_sq += (t.d0 - predicted).powi(2);
            error_sq += t.d0_error.powi(2);
        }
        let width = (residual_sq / n - error_sq / n).max(0.0).sqrt();

        let z_mean = tracks.iter().map(|t| t.z0).sum::<f64>() / n;
        let z_rms = (tracks.iter().map(|t| (t.z0 - z_mean).powi(2)).sum::<f64>() / n).sqrt();

        let bs = BeamSpot {
            x: Measurement::new(params[0], errors[0]),
            y: Measurement::new(params[1], errors[1]),
            z: Measurement::new(z_mean, z_rms / n.sqrt()),
            sigma_x: Measurement::new(width, width / (2.0 * n).sqrt()),
            sigma_y: Measurement::new(width, width / (2.0 * n).sqrt()),
            sigma_z: Measurement::new(z_rms, z_rms / (2.0 * n).sqrt()),
            dxdz: Measurement::new(params[2], errors[2]),
            dydz: Measurement::new(params[3], errors[3]),
        };

        if !bs.is_well_formed() {
            return Err(FitError::NonFinite);
        }

        Ok(bs)
    }
}

/// Weighted least squares of `d0` against the design row returned by `row`.
fn solve<const N: usize>(
    tracks: &[&TrackRecord],
    row: impl Fn(&TrackRecord) -> [f64; N],
) -> Option<([f64; N], [f64; N])> {
    let mut normal = [[0.0; N]; N];
    let mut rhs = [0.0; N];

    for t in tracks {
        let a = row(t);
        let w = 1.0 / (t.d0_error * t.d0_error);
        for i in 0..N {
            rhs[i] += w * a[i] * t.d0;
            for j in 0..N {
                normal[i][j] += w * a[i] * a[j];
            }
        }
    }

    let cov = invert(normal)?;

    let mut params = [0.0; N];
    let mut errors = [0.0; N];
    for i in 0..N {
        params[i] = (0..N).map(|j| cov[i][j] * rhs[j]).sum();
        errors[i] = cov[i][i].max(0.0).sqrt();
    }

    Some((params, errors))
}
