//! Beam spot monitoring over luminosity windows.
//!
//! Events are ingested into per-window accumulators held by a
//! [`monitor::cache::WindowCache`]. Closing a window runs the fitters once and
//! freezes an immutable [`monitor::window::WindowSnapshot`]. At run end the
//! [`monitor::aggregate::RunAggregator`] folds the run's snapshots into the
//! categorized [`monitor::store::HistogramStore`].

pub mod beamspot;
pub mod conditions;
pub mod config;
pub mod event;
pub mod export;
pub mod fitter;
pub mod monitor;
pub mod replay;
