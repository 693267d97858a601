use std::fmt;

use serde::{Deserialize, Serialize};

/// A value paired with its uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub error: f64,
}

impl Measurement {
    pub const fn new(value: f64, error: f64) -> Self {
        Self { value, error }
    }

    /// Both value and error are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.value.is_finite() && self.error.is_finite()
    }

    /// Usable as a weighted input: finite with a strictly positive error.
    pub fn is_weighted(&self) -> bool {
        self.is_finite() && self.error > 0.0
    }

    /// Difference of two measurements, errors added in quadrature.
    pub fn minus(&self, other: &Measurement) -> Measurement {
        Measurement {
            value: self.value - other.value,
            error: self.error.hypot(other.error),
        }
    }
}

/// Centroid and spread of the luminous region.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BeamSpot {
    pub x: Measurement,
    pub y: Measurement,
    pub z: Measurement,
    #[serde(default)]
    pub sigma_x: Measurement,
    #[serde(default)]
    pub sigma_y: Measurement,
    #[serde(default)]
    pub sigma_z: Measurement,
    #[serde(default)]
    pub dxdz: Measurement,
    #[serde(default)]
    pub dydz: Measurement,
}

impl BeamSpot {
    /// Returns the measurement for one monitored variable.
    pub fn get(&self, variable: Variable) -> Measurement {
        match variable {
            Variable::X => self.x,
            Variable::Y => self.y,
            Variable::Z => self.z,
            Variable::SigmaX => self.sigma_x,
            Variable::SigmaY => self.sigma_y,
            Variable::SigmaZ => self.sigma_z,
            Variable::DxDz => self.dxdz,
            Variable::DyDz => self.dydz,
        }
    }

    /// Mutable access to one monitored variable.
    pub fn get_mut(&mut self, variable: Variable) -> &mut Measurement {
        match variable {
            Variable::X => &mut self.x,
            Variable::Y => &mut self.y,
            Variable::Z => &mut self.z,
            Variable::SigmaX => &mut self.sigma_x,
            Variable::SigmaY => &mut self.sigma_y,
            Variable::SigmaZ => &mut self.sigma_z,
            Variable::DxDz => &mut self.dxdz,
            Variable::DyDz => &mut self.dydz,
        }
    }

    /// A reading is well-formed when every component is finite and no
    /// error is negative.
    pub fn is_well_formed(&self) -> bool {
        Variable::ALL.iter().all(|&v| {
            let m = self.get(v);
            m.is_finite() && m.error >= 0.0
        })
    }
}

/// Scalar quantities tracked per beam spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variable {
    X,
    Y,
    Z,
    SigmaX,
    SigmaY,
    SigmaZ,
    #[serde(rename = "dxdz")]
    DxDz,
    #[serde(rename = "dydz")]
    DyDz,
}

impl Variable {
    pub const ALL: [Variable; 8] = [
        Self::X,
        Self::Y,
        Self::Z,
        Self::SigmaX,
        Self::SigmaY,
        Self::SigmaZ,
        Self::DxDz,
        Self::DyDz,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
            Self::SigmaX => "sigma_x",
            Self::SigmaY => "sigma_y",
            Self::SigmaZ => "sigma_z",
            Self::DxDz => "dxdz",
            Self::DyDz => "dydz",
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method used to obtain a beam spot estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Track-based beam fit over one window.
    Fit,
    /// Primary-vertex fit over one window.
    VertexFit,
    /// Independent online measurement.
    Scaler,
    /// Calibration record from the conditions service.
    Conditions,
    /// Vertex estimate over every window of a run.
    PooledVertices,
}

impl Variant {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fit => "fit",
            Self::VertexFit => "vertex-fit",
            Self::Scaler => "scaler",
            Self::Conditions => "conditions",
            Self::PooledVertices => "pooled-vertices",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot() -> BeamSpot {
        BeamSpot {
            x: Measurement::new(0.1, 0.01),
            y: Measurement::new(-0.2, 0.02),
            z: Measurement::new(1.5, 0.3),
            sigma_z: Measurement::new(4.0, 0.1),
            ..Default::default()
        }
    }

    #[test]
    fn test_get_matches_fields() {
        let bs = spot();
        assert_eq!(bs.get(Variable::X), bs.x);
        assert_eq!(bs.get(Variable::Y), bs.y);
        assert_eq!(bs.get(Variable::SigmaZ), bs.sigma_z);
        assert_eq!(bs.get(Variable::DyDz), Measurement::default());
    }

    #[test]
    fn test_get_mut_writes_field() {
        let mut bs = spot();
        *bs.get_mut(Variable::DxDz) = Measurement::new(1e-4, 1e-5);
        assert_eq!(bs.dxdz.value, 1e-4);
    }

    #[test]
    fn test_minus_adds_errors_in_quadrature() {
        let a = Measurement::new(5.0, 3.0);
        let b = Measurement::new(2.0, 4.0);
        let d = a.minus(&b);
        assert_eq!(d.value, 3.0);
        assert!((d.error - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_well_formed_rejects_nan_and_negative_error() {
        assert!(spot().is_well_formed());

        let mut nan = spot();
        nan.y.value = f64::NAN;
        assert!(!nan.is_well_formed());

        let mut negative = spot();
        negative.z.error = -1.0;
        assert!(!negative.is_well_formed());
    }

    #[test]
    fn test_labels() {
        assert_eq!(Variable::SigmaX.as_str(), "sigma_x");
        assert_eq!(Variant::VertexFit.as_str(), "vertex-fit");
        assert_eq!(Variant::PooledVertices.to_string(), "pooled-vertices");
    }

    #[test]
    fn test_variant_deserializes_from_kebab_case() {
        let v: Variant = serde_json::from_str("\"vertex-fit\"").expect("parse");
        assert_eq!(v, Variant::VertexFit);
    }
}
