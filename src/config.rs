use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::beamspot::BeamSpot;

/// Top-level configuration for the beam monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Window and run bookkeeping.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Reference fitter thresholds.
    #[serde(default)]
    pub fitters: FitterConfig,

    /// Binning of the per-run track diagnostics.
    #[serde(default)]
    pub track_diagnostics: TrackDiagnosticsConfig,

    /// Calibration-record beam spots, each valid from its first window
    /// until the next entry.
    #[serde(default)]
    pub conditions: Vec<ConditionsEntry>,
}

/// Window and run bookkeeping configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Name used as the top-level folder in exported series. Default: "beamwatch".
    #[serde(default = "default_monitor_name")]
    pub name: String,

    /// Number of trailing values kept for drift display. Default: 10.
    #[serde(default = "default_values_to_save")]
    pub values_to_save: usize,

    /// Emit per-window and validation series. Disable for constrained output
    /// modes to keep output volume down. Default: true.
    #[serde(default = "default_true")]
    pub per_window_saving: bool,
}

/// Thresholds for the reference fitters.
#[derive(Debug, Clone, Deserialize)]
pub struct FitterConfig {
    /// Minimum accepted tracks for the d0-phi0 beam fit. Default: 50.
    #[serde(default = "default_min_tracks")]
    pub min_tracks: usize,

    /// Minimum accepted vertices for a vertex fit. Default: 10.
    #[serde(default = "default_min_vertices")]
    pub min_vertices: usize,

    /// Tracks with |d0| above this (cm) are excluded from the beam fit. Default: 0.5.
    #[serde(default = "default_max_track_d0")]
    pub max_track_d0: f64,
}

/// Binning of the per-run track diagnostics.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackDiagnosticsConfig {
    /// Number of phi0 bins in the d0 vs phi0 profile. Default: 32.
    #[serde(default = "default_phi_bins")]
    pub phi_bins: usize,

    /// Number of bins in the dxy distribution. Default: 100.
    #[serde(default = "default_dxy_bins")]
    pub dxy_bins: usize,

    /// Half-width (cm) of the dxy distribution. Default: 0.1.
    #[serde(default = "default_dxy_range")]
    pub dxy_range: f64,
}

/// One interval of validity of the calibration-record beam spot.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionsEntry {
    pub run: u32,
    /// First window the entry applies to. Default: 1.
    #[serde(default = "default_first_window")]
    pub first_window: u32,
    pub beam_spot: BeamSpot,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_monitor_name() -> String {
    "beamwatch".to_string()
}

fn default_values_to_save() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_min_tracks() -> usize {
    50
}

fn default_min_vertices() -> usize {
    10
}

fn default_max_track_d0() -> f64 {
    0.5
}

fn default_phi_bins() -> usize {
    32
}

fn default_dxy_bins() -> usize {
    100
}

fn default_dxy_range() -> f64 {
    0.1
}

fn default_first_window() -> u32 {
    1
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            monitor: MonitorConfig::default(),
            fitters: FitterConfig::default(),
            track_diagnostics: TrackDiagnosticsConfig::default(),
            conditions: Vec::new(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            name: default_monitor_name(),
            values_to_save: default_values_to_save(),
            per_window_saving: true,
        }
    }
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            min_tracks: default_min_tracks(),
            min_vertices: default_min_vertices(),
            max_track_d0: default_max_track_d0(),
        }
    }
}

impl Default for TrackDiagnosticsConfig {
    fn default() -> Self {
        Self {
            phi_bins: default_phi_bins(),
            dxy_bins: default_dxy_bins(),
            dxy_range: default_dxy_range(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.name.is_empty() {
            bail!("monitor.name must not be empty");
        }

        if self.monitor.values_to_save == 0 {
            bail!("monitor.values_to_save must be positive");
        }

        if self.fitters.min_tracks == 0 {
            bail!("fitters.min_tracks must be positive");
        }

        if self.fitters.min_vertices == 0 {
            bail!("fitters.min_vertices must be positive");
        }

        if !(self.fitters.max_track_d0.is_finite() && self.fitters.max_track_d0 > 0.0) {
            bail!("fitters.max_track_d0 must be a positive number");
        }

        let diag = &self.track_diagnostics;
        if diag.phi_bins == 0 || diag.dxy_bins == 0 {
            bail!("track_diagnostics bin counts must be positive");
        }
        if !(diag.dxy_range.is_finite() && diag.dxy_range > 0.0) {
            bail!("track_diagnostics.dxy_range must be a positive number");
        }

        let mut seen = HashSet::with_capacity(self.conditions.len());
        for entry in &self.conditions {
            if !seen.insert((entry.run, entry.first_window)) {
                bail!(
                    "duplicate conditions entry for run {} window {}",
                    entry.run,
                    entry.first_window
                );
            }
            if !entry.beam_spot.is_well_formed() {
                bail!(
                    "conditions entry for run {} window {} is not a valid beam spot",
                    entry.run,
                    entry.first_window
                );
            }
        }

        Ok(())
    }
}
