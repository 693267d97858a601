use crate::beamspot::{BeamSpot, Measurement, Variant};
use crate::event::VertexSample;

use super::{FitError, FitInput, FitterPort};

/// Beam spot estimate from primary vertex positions.
///
/// The centroid is the precision-weighted mean of the vertex positions, the
/// widths are the RMS spread around it, and the slopes come from a linear
/// regression of x and y against z.
#[derive(Debug, Clone)]
pub struct WeightedVertexFitter {
    variant: Variant,
    min_vertices: usize,
}

impl WeightedVertexFitter {
    pub fn new(variant: Variant, min_vertices: usize) -> Self {
        Self {
            variant,
            min_vertices: min_vertices.max(2),
        }
    }
}

impl FitterPort for WeightedVertexFitter {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn fit(&self, input: &FitInput<'_>) -> Result<BeamSpot, FitError> {
        let samples = input.vertices;
        if samples.len() < self.min_vertices {
            return Err(FitError::InsufficientData {
                needed: self.min_vertices,
                available: samples.len(),
            });
        }

        let n = samples.len() as f64;
        let x = weighted_mean(samples, VertexSample::x)?;
        let y = weighted_mean(samples, VertexSample::y)?;
        let z = weighted_mean(samples, VertexSample::z)?;

        let sigma_x = spread(samples, VertexSample::x, n);
        let sigma_y = spread(samples, VertexSample::y, n);
        let sigma_z = spread(samples, VertexSample::z, n);

        let bs = BeamSpot {
            x,
            y,
            z,
            sigma_x,
            sigma_y,
            sigma_z,
            dxdz: slope(samples, VertexSample::x),
            dydz: slope(samples, VertexSample::y),
        };

        if !bs.is_well_formed() {
            return Err(FitError::NonFinite);
        }

        Ok(bs)
    }
}

fn weighted_mean(
    samples: &[VertexSample],
    axis: fn(&VertexSample) -> Measurement,
) -> Result<Measurement, FitError> {
    let mut sum_w = 0.0;
    let mut sum_wx = 0.0;
    for s in samples {
        let m = axis(s);
        let w = 1.0 / (m.error * m.error);
        sum_w += w;
        sum_wx += w * m.value;
    }
    if sum_w <= 0.0 || !sum_w.is_finite() {
        return Err(FitError::NonFinite);
    }
    Ok(Measurement::new(sum_wx / sum_w, sum_w.sqrt().recip()))
}

fn spread(samples: &[VertexSample], axis: fn(&VertexSample) -> Measurement, n: f64) -> Measurement {
    let mean = samples.iter().map(|s| axis(s).value).sum::<f64>() / n;
    let rms = (samples
        .iter()
        .map(|s| (axis(s).value - mean).powi(2))
        .sum::<f64>()
        / n)
        .sqrt();
    Measurement::new(rms, rms / (2.0 * n).sqrt())
}

/// Least-squares slope of a transverse coordinate against z. Zero with zero
/// error when z has no spread.
fn slope(samples: &[VertexSample], axis: fn(&VertexSample) -> Measurement) -> Measurement {
    let n = samples.len() as f64;
    let mean_z = samples.iter().map(|s| s.z().value).sum::<f64>() / n;
    let mean_t = samples.iter().map(|s| axis(s).value).sum::<f64>() / n;

    let mut szz = 0.0;
    let mut szt = 0.0;
    for s in samples {
        let dz = s.z().value - mean_z;
        szz += dz * dz;
        szt += dz * (axis(s).value - mean_t);
    }
    if szz <= f64::EPSILON || n < 3.0 {
        return Measurement::default();
    }

    let b = szt / szz;
    let residual = samples
        .iter()
        .map(|s| {
            let r = axis(s).value - mean_t - b * (s.z().value - mean_z);
            r * r
        })
        .sum::<f64>();
    let error = (residual / (n - 2.0) / szz).sqrt();
    Measurement::new(b, error)
}
