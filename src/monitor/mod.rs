//! Window and run lifecycle.
//!
//! [`BeamMonitor`] wires the window cache, event ingestion, the series
//! store and run aggregation together behind explicit state transitions:
//!
//! ```text
//! Window: Open -> Closed
//! Run:    Active -> Aggregating -> Done
//!         Active -> Aborted
//! ```

pub mod aggregate;
pub mod cache;
pub mod error;
pub mod histogram;
pub mod ingest;
pub mod store;
pub mod window;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::beamspot::{BeamSpot, Variable, Variant};
use crate::conditions::{ConditionsSource, IovConditions};
use crate::config::{Config, MonitorConfig, TrackDiagnosticsConfig};
use crate::event::stats::IngestStats;
use crate::event::EventRecord;
use crate::fitter::FitterSet;

use self::aggregate::RunAggregator;
use self::cache::{WindowCache, WindowHandle};
use self::error::{MonitorError, Result};
use self::histogram::{TrackDiagnostics, TrackDiagnosticsSnapshot};
use self::ingest::{EventIngestor, IngestOutcome};
use self::store::{Category, HistogramStore, Series, SlotPoint};
use self::window::{WindowId, WindowSnapshot};

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Active,
    Aggregating,
    Done,
    Aborted,
}

impl RunPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trailing by-run values of one series at the time a run finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftSeries {
    pub series: String,
    pub points: Vec<SlotPoint>,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: u32,
    pub processed_windows: Vec<WindowId>,
    pub beam_spots: BTreeMap<Variant, BeamSpot>,
    pub points_committed: usize,
    pub drift: Vec<DriftSeries>,
    pub track_diagnostics: Option<TrackDiagnosticsSnapshot>,
}

/// Coordinates windows and runs.
pub struct BeamMonitor {
    cfg: MonitorConfig,
    diagnostics_cfg: TrackDiagnosticsConfig,
    cache: WindowCache,
    store: HistogramStore,
    ingestor: EventIngestor,
    aggregator: RunAggregator,
    conditions: Option<Arc<dyn ConditionsSource>>,
    runs: DashMap<u32, RunPhase>,
    diagnostics: DashMap<u32, Arc<TrackDiagnostics>>,
}

impl BeamMonitor {
    /// Builds a monitor with the reference fitters and the configured
    /// conditions table.
    pub fn new(cfg: &Config) -> Self {
        let iov = IovConditions::from_entries(&cfg.conditions);
        let conditions: Option<Arc<dyn ConditionsSource>> = if iov.is_empty() {
            None
        } else {
            Some(Arc::new(iov))
        };
        Self::with_fitters(cfg, FitterSet::from_config(&cfg.fitters), conditions)
    }

    pub fn with_fitters(
        cfg: &Config,
        fitters: FitterSet,
        conditions: Option<Arc<dyn ConditionsSource>>,
    ) -> Self {
        let aggregator =
            RunAggregator::new(cfg.monitor.per_window_saving, Arc::clone(&fitters.pooled));
        Self {
            cfg: cfg.monitor.clone(),
            diagnostics_cfg: cfg.track_diagnostics.clone(),
            cache: WindowCache::new(fitters),
            store: HistogramStore::new(),
            ingestor: EventIngestor::new(Arc::new(IngestStats::new())),
            aggregator,
            conditions,
            runs: DashMap::new(),
            diagnostics: DashMap::new(),
        }
    }

    pub fn begin_run(&self, run: u32) -> Result<()> {
        match self.runs.entry(run) {
            Entry::Occupied(_) => Err(MonitorError::RunAlreadyStarted { run }),
            Entry::Vacant(slot) => {
                slot.insert(RunPhase::Active);
                self.diagnostics.insert(
                    run,
                    Arc::new(TrackDiagnostics::new(&self.diagnostics_cfg)),
                );
                info!(run, "run started");
                Ok(())
            }
        }
    }

    /// Opens a window of an active run and seeds it with the calibration
    /// record beam spot, when one covers the window.
    pub fn begin_window(&self, id: WindowId) -> Result<WindowHandle> {
        // Holding the phase entry keeps end_run from starting mid-open.
        let phase = self
            .runs
            .get(&id.run)
            .ok_or(MonitorError::RunNotActive { run: id.run })?;
        if *phase != RunPhase::Active {
            return Err(MonitorError::RunNotActive { run: id.run });
        }

        let handle = self.cache.open(id)?;
        drop(phase);

        match self.conditions.as_ref().and_then(|c| c.beam_spot(id)) {
            Some(bs) => handle.with_accumulator(|acc| acc.conditions = Some(bs))?,
            None => debug!(window = %id, "no conditions beam spot for window"),
        }

        Ok(handle)
    }

    pub fn ingest(&self, handle: &WindowHandle, event: &EventRecord) -> Result<IngestOutcome> {
        let diagnostics = self
            .diagnostics
            .get(&handle.id().run)
            .map(|d| Arc::clone(d.value()));
        self.ingestor.ingest(handle, event, diagnostics.as_deref())
    }

    /// Closes a window. Idempotent.
    pub fn end_window(&self, id: WindowId) -> Result<Arc<WindowSnapshot>> {
        self.cache.close(id)
    }

    /// Aggregates a run whose windows are all closed, commits its series
    /// and evicts its windows.
    pub fn end_run(&self, run: u32) -> Result<RunReport> {
        {
            let mut phase = self
                .runs
                .get_mut(&run)
                .ok_or(MonitorError::RunNotActive { run })?;
            if *phase != RunPhase::Active {
                return Err(MonitorError::RunNotActive { run });
            }
            let open = self.cache.open_windows(run);
            if open > 0 {
                return Err(MonitorError::WindowsStillOpen { run, open });
            }
            *phase = RunPhase::Aggregating;
        }

        let snapshots = self.cache.snapshots_for_run(run);
        let summary = self.aggregator.aggregate(run, &snapshots);
        drop(snapshots);

        let committed = match self.store.append_batch(&summary.points) {
            Ok(n) => n,
            Err(err) => {
                error!(run, %err, "run summary rejected; discarding run");
                self.cache.discard_run(run);
                self.diagnostics.remove(&run);
                self.set_phase(run, RunPhase::Aborted);
                return Err(err);
            }
        };

        let evicted = self.cache.evict_run(run);
        let track_diagnostics = self.diagnostics.remove(&run).map(|(_, d)| d.snapshot());
        let drift = self.drift(&summary.beam_spots);
        self.set_phase(run, RunPhase::Done);

        let windows: Vec<String> = summary
            .processed_windows
            .iter()
            .map(|id| id.window.to_string())
            .collect();
        info!(
            run,
            windows = %windows.join(","),
            points = committed,
            evicted,
            "run aggregated",
        );
        for series in &drift {
            let values: Vec<f64> = series.points.iter().map(|p| p.value).collect();
            info!(run, series = %series.series, ?values, "drift");
        }

        Ok(RunReport {
            run,
            processed_windows: summary.processed_windows,
            beam_spots: summary.beam_spots,
            points_committed: committed,
            drift,
            track_diagnostics,
        })
    }

    /// Cancels an active run. Open and closed windows are dropped and nothing
    /// is committed. Returns the number of windows dropped.
    pub fn abort_run(&self, run: u32) -> Result<usize> {
        let mut phase = self
            .runs
            .get_mut(&run)
            .ok_or(MonitorError::RunNotActive { run })?;
        if *phase != RunPhase::Active {
            return Err(MonitorError::RunNotActive { run });
        }

        let dropped = self.cache.discard_run(run);
        self.diagnostics.remove(&run);
        *phase = RunPhase::Aborted;
        drop(phase);
        warn!(run, dropped, "run aborted");
        Ok(dropped)
    }

    pub fn run_phase(&self, run: u32) -> Option<RunPhase> {
        self.runs.get(&run).map(|p| *p)
    }

    /// Runs still accepting windows, sorted.
    pub fn active_runs(&self) -> Vec<u32> {
        let mut runs: Vec<u32> = self
            .runs
            .iter()
            .filter(|e| *e.value() == RunPhase::Active)
            .map(|e| *e.key())
            .collect();
        runs.sort_unstable();
        runs
    }

    pub fn store(&self) -> &HistogramStore {
        &self.store
    }

    pub fn cache(&self) -> &WindowCache {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        self.ingestor.stats()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.cfg
    }

    fn set_phase(&self, run: u32, phase: RunPhase) {
        if let Some(mut p) = self.runs.get_mut(&run) {
            *p = phase;
        }
    }

    fn drift(&self, variants: &BTreeMap<Variant, BeamSpot>) -> Vec<DriftSeries> {
        let mut out = Vec::new();
        for &variant in variants.keys() {
            for variable in [Variable::X, Variable::Y, Variable::Z] {
                let series = Series::Variant(variant);
                let points =
                    self.store
                        .trend(variable, Category::ByRun, series, self.cfg.values_to_save);
                if !points.is_empty() {
                    out.push(DriftSeries {
                        series: format!("{variable}/{}/{series}", Category::ByRun),
                        points,
                    });
                }
            }
        }
        out
    }
}

impl fmt::Debug for BeamMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeamMonitor")
            .field("name", &self.cfg.name)
            .field("windows", &self.cache.len())
            .field("slots", &self.store.len())
            .field("runs", &self.runs.len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use super::store::SlotKey;
    use super::testing::{counting_fitters, sample_spot, valid_vertex};

    fn monitor(beam: Option<BeamSpot>) -> BeamMonitor {
        let (fitters, _, _) = counting_fitters(beam, None);
        BeamMonitor::with_fitters(&Config::default(), fitters, None)
    }

    fn event_with_vertices(n: usize) -> EventRecord {
        EventRecord {
            vertices: (0..n).map(|i| valid_vertex(0.001 * i as f64)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let m = monitor(Some(sample_spot(0.1)));
        m.begin_run(1).expect("begin run");

        for w in 1..=3 {
            let id = WindowId::new(1, w);
            let handle = m.begin_window(id).expect("begin window");
            m.ingest(&handle, &event_with_vertices(3)).expect("ingest");
            m.end_window(id).expect("end window");
        }

        let report = m.end_run(1).expect("end run");
        assert_eq!(report.processed_windows.len(), 3);
        assert!(report.beam_spots.contains_key(&Variant::Fit));
        assert!(report.beam_spots.contains_key(&Variant::PooledVertices));
        assert!(report.points_committed > 0);
        assert!(report.track_diagnostics.is_some());
        assert_eq!(m.run_phase(1), Some(RunPhase::Done));
        assert!(m.cache().is_empty());

        let by_window = m
            .store()
            .get(&SlotKey::variant(1, Variable::X, Category::ByWindow, Variant::Fit));
        assert_eq!(by_window.len(), 3);
        assert!(report
            .drift
            .iter()
            .any(|d| d.series == "x/by-run/fit" && d.points.len() == 1));
    }

    #[test]
    fn test_begin_run_twice() {
        let m = monitor(None);
        m.begin_run(4).expect("begin");
        assert_eq!(
            m.begin_run(4).expect_err("repeat"),
            MonitorError::RunAlreadyStarted { run: 4 }
        );
    }

    #[test]
    fn test_begin_window_requires_active_run() {
        let m = monitor(None);
        assert_eq!(
            m.begin_window(WindowId::new(9, 1)).expect_err("unknown run"),
            MonitorError::RunNotActive { run: 9 }
        );

        m.begin_run(9).expect("begin");
        m.end_run(9).expect("empty run");
        assert!(matches!(
            m.begin_window(WindowId::new(9, 1)),
            Err(MonitorError::RunNotActive { .. })
        ));
    }

    #[test]
    fn test_end_run_with_open_window() {
        let m = monitor(None);
        m.begin_run(2).expect("begin");
        m.begin_window(WindowId::new(2, 1)).expect("open");
        assert_eq!(
            m.end_run(2).expect_err("open window"),
            MonitorError::WindowsStillOpen { run: 2, open: 1 }
        );
        assert_eq!(m.run_phase(2), Some(RunPhase::Active));
    }

    #[test]
    fn test_empty_run_is_done_with_no_points() {
        let m = monitor(None);
        m.begin_run(3).expect("begin");
        assert_eq!(m.run_phase(3), Some(RunPhase::Active));

        let report = m.end_run(3).expect("end");
        assert_eq!(report.points_committed, 0);
        assert!(report.processed_windows.is_empty());
        assert_eq!(m.run_phase(3), Some(RunPhase::Done));
        assert!(m.store().is_empty());
    }

    #[test]
    fn test_abort_commits_nothing() {
        let m = monitor(Some(sample_spot(0.1)));
        m.begin_run(5).expect("begin");
        let closed = WindowId::new(5, 1);
        m.begin_window(closed).expect("open");
        m.end_window(closed).expect("close");
        let open = m.begin_window(WindowId::new(5, 2)).expect("open");

        assert_eq!(m.abort_run(5).expect("abort"), 2);
        assert_eq!(m.run_phase(5), Some(RunPhase::Aborted));
        assert!(m.store().is_empty());
        assert!(m.cache().is_empty());
        assert!(m.cache().get(closed).is_none());
        assert!(matches!(
            m.ingest(&open, &EventRecord::default()),
            Err(MonitorError::WindowClosed { .. })
        ));
        assert!(matches!(m.end_run(5), Err(MonitorError::RunNotActive { .. })));
        assert!(m.active_runs().is_empty());
    }

    #[test]
    fn test_conditions_seeded_from_source() {
        let mut iov = IovConditions::new();
        iov.insert(WindowId::new(6, 2), sample_spot(0.05));
        let (fitters, _, _) = counting_fitters(None, None);
        let m = BeamMonitor::with_fitters(&Config::default(), fitters, Some(Arc::new(iov)));

        m.begin_run(6).expect("begin");
        for w in [1, 2] {
            m.begin_window(WindowId::new(6, w)).expect("open");
        }
        let first = m.end_window(WindowId::new(6, 1)).expect("close");
        let second = m.end_window(WindowId::new(6, 2)).expect("close");

        assert!(!first.has(Variant::Conditions));
        assert_eq!(second.beam_spot(Variant::Conditions), Some(&sample_spot(0.05)));
    }

    #[test]
    fn test_runs_book_their_own_series() {
        let m = monitor(Some(sample_spot(0.1)));
        for run in [10, 11] {
            m.begin_run(run).expect("begin");
            let id = WindowId::new(run, 1);
            m.begin_window(id).expect("open");
            m.end_window(id).expect("close");
            m.end_run(run).expect("end");
        }

        for run in [10, 11] {
            let by_run = m
                .store()
                .get(&SlotKey::variant(run, Variable::X, Category::ByRun, Variant::Fit));
            let idx: Vec<u64> = by_run.points().iter().map(|p| p.index).collect();
            assert_eq!(idx, vec![u64::from(run)]);

            let by_window = m
                .store()
                .get(&SlotKey::variant(run, Variable::X, Category::ByWindow, Variant::Fit));
            assert_eq!(by_window.points()[0].index, 1);
        }
        assert_eq!(m.active_runs(), Vec::<u32>::new());
    }

    #[test]
    fn test_later_run_may_finish_first() {
        let m = monitor(Some(sample_spot(0.1)));
        for run in [10, 11] {
            m.begin_run(run).expect("begin");
            let id = WindowId::new(run, 1);
            let handle = m.begin_window(id).expect("open");
            m.ingest(&handle, &event_with_vertices(12)).expect("ingest");
            m.end_window(id).expect("close");
        }

        let later = m.end_run(11).expect("run 11 ends first");
        let earlier = m.end_run(10).expect("run 10 still commits");

        assert!(later.points_committed > 0);
        assert_eq!(earlier.points_committed, later.points_committed);
        assert_eq!(m.run_phase(10), Some(RunPhase::Done));
        assert_eq!(m.run_phase(11), Some(RunPhase::Done));

        let trend: Vec<u64> = m
            .store()
            .trend(Variable::X, Category::ByRun, Series::Variant(Variant::Fit), 5)
            .iter()
            .map(|p| p.index)
            .collect();
        assert_eq!(trend, vec![10, 11]);

        let drift = earlier
            .drift
            .iter()
            .find(|d| d.series == "x/by-run/fit")
            .expect("fit drift");
        assert_eq!(drift.points.len(), 2);
    }
}
