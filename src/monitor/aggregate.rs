use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::beamspot::{BeamSpot, Measurement, Variable, Variant};
use crate::event::VertexSample;
use crate::fitter::{FitInput, FitterPort};

use super::cache::run_fitter;
use super::store::{Category, Series, SlotKey, SlotPoint};
use super::window::{WindowId, WindowSnapshot};

/// Variant pairs compared per window in the validation category.
pub const VALIDATION_PAIRS: [(Variant, Variant); 4] = [
    (Variant::VertexFit, Variant::Conditions),
    (Variant::Scaler, Variant::Conditions),
    (Variant::VertexFit, Variant::Scaler),
    (Variant::Fit, Variant::Conditions),
];

/// Everything one run contributes, staged before commit.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run: u32,
    pub processed_windows: Vec<WindowId>,
    /// Run-level estimate per variant.
    pub beam_spots: BTreeMap<Variant, BeamSpot>,
    pub points: Vec<(SlotKey, SlotPoint)>,
}

/// Folds a run's closed windows into series points.
///
/// Reads snapshots only; the caller commits the staged points.
pub struct RunAggregator {
    per_window_saving: bool,
    pooled: Arc<dyn FitterPort>,
}

impl RunAggregator {
    pub fn new(per_window_saving: bool, pooled: Arc<dyn FitterPort>) -> Self {
        Self {
            per_window_saving,
            pooled,
        }
    }

    /// `snapshots` must be the run's windows in window order.
    pub fn aggregate(&self, run: u32, snapshots: &[Arc<WindowSnapshot>]) -> RunSummary {
        let mut summary = RunSummary {
            run,
            processed_windows: snapshots.iter().map(|s| s.id).collect(),
            ..Default::default()
        };
        if snapshots.is_empty() {
            return summary;
        }

        let variants: BTreeSet<Variant> = snapshots
            .iter()
            .flat_map(|s| s.beam_spots.keys().copied())
            .collect();

        if self.per_window_saving {
            stage_by_window(run, &variants, snapshots, &mut summary.points);
            stage_validation(run, snapshots, &mut summary.points);
        }

        for &variant in &variants {
            let spots = snapshots.iter().filter_map(|s| s.beam_spot(variant));
            if let Some(mean) = weighted_mean(spots) {
                summary.beam_spots.insert(variant, mean);
            }
        }

        let pooled: Vec<VertexSample> = snapshots
            .iter()
            .flat_map(|s| s.vertex_samples.iter().copied())
            .collect();
        let input = FitInput {
            vertices: &pooled,
            tracks: &[],
        };
        if let Some(bs) = run_fitter(format!("run {run}"), self.pooled.as_ref(), &input) {
            summary.beam_spots.insert(self.pooled.variant(), bs);
        }

        let index = u64::from(run);
        for (&variant, bs) in &summary.beam_spots {
            for variable in Variable::ALL {
                let m = bs.get(variable);
                if m.is_finite() {
                    summary.points.push((
                        SlotKey::variant(run, variable, Category::ByRun, variant),
                        point(index, m),
                    ));
                }
            }
        }

        summary
    }
}

fn stage_by_window(
    run: u32,
    variants: &BTreeSet<Variant>,
    snapshots: &[Arc<WindowSnapshot>],
    points: &mut Vec<(SlotKey, SlotPoint)>,
) {
    for &variant in variants {
        for snap in snapshots {
            let Some(bs) = snap.beam_spot(variant) else {
                continue;
            };
            let index = u64::from(snap.id.window);
            for variable in Variable::ALL {
                points.push((
                    SlotKey::variant(run, variable, Category::ByWindow, variant),
                    point(index, bs.get(variable)),
                ));
            }
        }
    }
}

fn stage_validation(
    run: u32,
    snapshots: &[Arc<WindowSnapshot>],
    points: &mut Vec<(SlotKey, SlotPoint)>,
) {
    for (a, b) in VALIDATION_PAIRS {
        for snap in snapshots {
            let (Some(lhs), Some(rhs)) = (snap.beam_spot(a), snap.beam_spot(b)) else {
                continue;
            };
            let index = u64::from(snap.id.window);
            for variable in Variable::ALL {
                let diff = lhs.get(variable).minus(&rhs.get(variable));
                points.push((
                    SlotKey::new(run, variable, Category::Validation, Series::Difference(a, b)),
                    point(index, diff),
                ));
            }
        }
    }
}

/// Precision-weighted mean per variable. Variables with no weighted input
/// are left non-finite so no by-run point is staged for them. Returns `None`
/// when no variable had any weighted input.
fn weighted_mean<'a>(spots: impl Iterator<Item = &'a BeamSpot>) -> Option<BeamSpot> {
    let mut sums = [(0.0_f64, 0.0_f64); Variable::ALL.len()];
    for bs in spots {
        for (i, variable) in Variable::ALL.into_iter().enumerate() {
            let m = bs.get(variable);
            if m.is_weighted() {
                let w = 1.0 / (m.error * m.error);
                sums[i].0 += w * m.value;
                sums[i].1 += w;
            }
        }
    }

    if sums.iter().all(|(_, w)| *w <= 0.0) {
        return None;
    }

    let mut mean = BeamSpot::default();
    for (i, variable) in Variable::ALL.into_iter().enumerate() {
        let (sum, weight) = sums[i];
        *mean.get_mut(variable) = if weight > 0.0 {
            Measurement::new(sum / weight, weight.sqrt().recip())
        } else {
            Measurement::new(f64::NAN, f64::NAN)
        };
    }
    Some(mean)
}

fn point(index: u64, m: Measurement) -> SlotPoint {
    SlotPoint {
        index,
        value: m.value,
        error: m.error,
    }
}
