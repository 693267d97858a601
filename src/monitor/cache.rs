use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::beamspot::{BeamSpot, Variant};
use crate::fitter::{FitError, FitInput, FitterPort, FitterSet};

use super::error::{MonitorError, Result};
use super::window::{WindowAccumulator, WindowId, WindowSnapshot};

/// Cache slot for one window. The accumulator lives until close takes it;
/// the snapshot is set exactly once.
struct WindowEntry {
    id: WindowId,
    open: Mutex<Option<WindowAccumulator>>,
    snapshot: OnceLock<Arc<WindowSnapshot>>,
}

impl WindowEntry {
    fn is_closed(&self) -> bool {
        self.snapshot.get().is_some()
    }
}

/// Handle to an open window's accumulation state.
///
/// Handles are cheap to clone. After the window closes, every mutation
/// through a handle fails with [`MonitorError::WindowClosed`].
#[derive(Clone)]
pub struct WindowHandle {
    entry: Arc<WindowEntry>,
}

impl WindowHandle {
    pub fn id(&self) -> WindowId {
        self.entry.id
    }

    pub fn is_closed(&self) -> bool {
        self.entry.is_closed()
    }

    /// Runs `f` against the open accumulator.
    pub(crate) fn with_accumulator<R>(
        &self,
        f: impl FnOnce(&mut WindowAccumulator) -> R,
    ) -> Result<R> {
        let mut guard = self.entry.open.lock();
        match guard.as_mut() {
            Some(acc) => Ok(f(acc)),
            None => Err(MonitorError::WindowClosed { id: self.entry.id }),
        }
    }
}

impl std::fmt::Debug for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowHandle")
            .field("id", &self.entry.id)
            .field("closed", &self.entry.is_closed())
            .finish()
    }
}

/// Owns every window's state, from open to eviction.
///
/// Uses `DashMap` so lookups and closes of unrelated windows never contend
/// on a global lock. The map lock is only held to clone the entry `Arc`;
/// fitting happens outside it.
pub struct WindowCache {
    windows: DashMap<WindowId, Arc<WindowEntry>>,
    fitters: FitterSet,
}

impl WindowCache {
    pub fn new(fitters: FitterSet) -> Self {
        Self {
            windows: DashMap::with_capacity(64),
            fitters,
        }
    }

    /// Allocates accumulation state for a new window.
    pub fn open(&self, id: WindowId) -> Result<WindowHandle> {
        match self.windows.entry(id) {
            Entry::Occupied(_) => Err(MonitorError::DuplicateWindow { id }),
            Entry::Vacant(slot) => {
                let entry = Arc::new(WindowEntry {
                    id,
                    open: Mutex::new(Some(WindowAccumulator::default())),
                    snapshot: OnceLock::new(),
                });
                slot.insert(Arc::clone(&entry));
                Ok(WindowHandle { entry })
            }
        }
    }

    /// Returns a handle to a window that is still open.
    pub fn handle(&self, id: WindowId) -> Option<WindowHandle> {
        self.windows
            .get(&id)
            .filter(|e| !e.is_closed())
            .map(|e| WindowHandle {
                entry: Arc::clone(e.value()),
            })
    }

    /// Freezes a window, runs both fitters once, and caches the snapshot.
    ///
    /// Closing an already closed window returns the cached snapshot without
    /// fitting again. Concurrent closes of the same window fit once.
    pub fn close(&self, id: WindowId) -> Result<Arc<WindowSnapshot>> {
        let entry = self
            .windows
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(MonitorError::UnknownWindow { id })?;

        let snapshot = entry.snapshot.get_or_init(|| {
            let acc = entry.open.lock().take().unwrap_or_default();
            Arc::new(self.materialize(id, acc))
        });

        Ok(Arc::clone(snapshot))
    }

    /// Read-only lookup of a closed window.
    pub fn get(&self, id: WindowId) -> Option<Arc<WindowSnapshot>> {
        self.windows
            .get(&id)
            .and_then(|e| e.snapshot.get().map(Arc::clone))
    }

    /// Releases the cache's reference to a closed window. Snapshots already
    /// handed out stay valid. Open windows are not evicted.
    pub fn evict(&self, id: WindowId) -> bool {
        self.windows
            .remove_if(&id, |_, e| e.is_closed())
            .is_some()
    }

    /// Closed snapshots of a run, in window order.
    pub fn snapshots_for_run(&self, run: u32) -> Vec<Arc<WindowSnapshot>> {
        let mut snapshots: Vec<Arc<WindowSnapshot>> = self
            .windows
            .iter()
            .filter(|e| e.key().run == run)
            .filter_map(|e| e.snapshot.get().map(Arc::clone))
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Number of windows of a run that are still open.
    pub fn open_windows(&self, run: u32) -> usize {
        self.windows
            .iter()
            .filter(|e| e.key().run == run && !e.is_closed())
            .count()
    }

    /// Evicts every closed window of a run. Returns the number evicted.
    pub fn evict_run(&self, run: u32) -> usize {
        self.run_ids(run)
            .into_iter()
            .filter(|id| self.evict(*id))
            .count()
    }

    /// Drops every window of a run, open or closed, without producing
    /// snapshots for the open ones. Outstanding handles to dropped open
    /// windows fail from then on. Returns the number dropped.
    pub fn discard_run(&self, run: u32) -> usize {
        self.run_ids(run)
            .into_iter()
            .filter_map(|id| self.windows.remove(&id))
            .map(|(_, entry)| entry.open.lock().take())
            .count()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn run_ids(&self, run: u32) -> Vec<WindowId> {
        self.windows
            .iter()
            .map(|e| *e.key())
            .filter(|id| id.run == run)
            .collect()
    }

    fn materialize(&self, id: WindowId, acc: WindowAccumulator) -> WindowSnapshot {
        let input = FitInput {
            vertices: &acc.vertex_samples,
            tracks: &acc.tracks,
        };

        let mut beam_spots = BTreeMap::new();
        for fitter in [&self.fitters.beam, &self.fitters.vertex] {
            if let Some(bs) = run_fitter(id, fitter.as_ref(), &input) {
                beam_spots.insert(fitter.variant(), bs);
            }
        }
        if let Some(bs) = acc.scaler {
            beam_spots.insert(Variant::Scaler, bs);
        }
        if let Some(bs) = acc.conditions {
            beam_spots.insert(Variant::Conditions, bs);
        }

        debug!(
            window = %id,
            variants = beam_spots.len(),
            vertices = acc.vertex_samples.len(),
            tracks = acc.tracks.len(),
            "window closed",
        );

        WindowSnapshot {
            id,
            beam_spots,
            vertex_samples: acc.vertex_samples,
            counters: acc.counters,
        }
    }
}

/// Runs one fitter; failures mean the variant is absent, never an error.
pub(crate) fn run_fitter(
    id: impl std::fmt::Display,
    fitter: &dyn FitterPort,
    input: &FitInput<'_>,
) -> Option<BeamSpot> {
    match fitter.fit(input) {
        Ok(bs) => Some(bs),
        Err(err @ FitError::InsufficientData { .. }) => {
            debug!(scope = %id, variant = %fitter.variant(), %err, "fit skipped");
            None
        }
        Err(err) => {
            warn!(scope = %id, variant = %fitter.variant(), %err, "fit failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::event::{VertexRecord, VertexSample};
    use crate::monitor::testing::{counting_fitters, sample_spot};

    fn id(window: u32) -> WindowId {
        WindowId::new(1, window)
    }

    #[test]
    fn test_open_twice_is_duplicate() {
        let (fitters, _, _) = counting_fitters(None, None);
        let cache = WindowCache::new(fitters);
        cache.open(id(1)).expect("first open");
        let err = cache.open(id(1)).expect_err("second open");
        assert_eq!(err, MonitorError::DuplicateWindow { id: id(1) });
    }

    #[test]
    fn test_open_after_close_is_duplicate() {
        let (fitters, _, _) = counting_fitters(None, None);
        let cache = WindowCache::new(fitters);
        cache.open(id(1)).expect("open");
        cache.close(id(1)).expect("close");
        assert!(matches!(
            cache.open(id(1)),
            Err(MonitorError::DuplicateWindow { .. })
        ));
    }

    #[test]
    fn test_get_never_opened_is_none() {
        let (fitters, _, _) = counting_fitters(None, None);
        let cache = WindowCache::new(fitters);
        assert!(cache.get(id(9)).is_none());
    }

    #[test]
    fn test_get_open_window_is_none() {
        let (fitters, _, _) = counting_fitters(None, None);
        let cache = WindowCache::new(fitters);
        cache.open(id(1)).expect("open");
        assert!(cache.get(id(1)).is_none());
    }

    #[test]
    fn test_close_unknown_window() {
        let (fitters, _, _) = counting_fitters(None, None);
        let cache = WindowCache::new(fitters);
        assert_eq!(
            cache.close(id(3)).expect_err("unknown"),
            MonitorError::UnknownWindow { id: id(3) }
        );
    }

    #[test]
    fn test_close_is_idempotent_and_fits_once() {
        let (fitters, beam, vertex) = counting_fitters(Some(sample_spot(0.1)), None);
        let cache = WindowCache::new(fitters);
        cache.open(id(1)).expect("open");

        let first = cache.close(id(1)).expect("close");
        let second = cache.close(id(1)).expect("close again");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
        assert_eq!(beam.calls(), 1);
        assert_eq!(vertex.calls(), 1);
    }

    #[test]
    fn test_insufficient_data_omits_variant() {
        let (fitters, _, _) = counting_fitters(Some(sample_spot(0.1)), None);
        let cache = WindowCache::new(fitters);
        cache.open(id(1)).expect("open");
        let snap = cache.close(id(1)).expect("close");

        assert!(snap.has(Variant::Fit));
        assert!(!snap.has(Variant::VertexFit));
        assert!(!snap.has(Variant::Scaler));
    }

    #[test]
    fn test_close_carries_accumulated_state() {
        let (fitters, _, _) = counting_fitters(None, None);
        let cache = WindowCache::new(fitters);
        let handle = cache.open(id(1)).expect("open");
        handle
            .with_accumulator(|acc| {
                acc.vertex_samples.push(VertexSample::from(&VertexRecord {
                    x: 0.1,
                    y: 0.1,
                    z: 0.0,
                    x_error: 0.01,
                    y_error: 0.01,
                    z_error: 0.1,
                    tracks: 5,
                }));
                acc.scaler = Some(sample_spot(0.2));
                acc.counters.events = 4;
            })
            .expect("open window");

        let snap = cache.close(id(1)).expect("close");
        assert_eq!(snap.vertex_samples.len(), 1);
        assert_eq!(snap.counters.events, 4);
        assert_eq!(snap.beam_spot(Variant::Scaler), Some(&sample_spot(0.2)));
        assert!(handle.is_closed());
        assert_eq!(
            handle.with_accumulator(|_| ()).expect_err("closed"),
            MonitorError::WindowClosed { id: id(1) }
        );
    }

    #[test]
    fn test_evict_keeps_held_snapshot_valid() {
        let (fitters, _, _) = counting_fitters(Some(sample_spot(0.3)), None);
        let cache = WindowCache::new(fitters);
        cache.open(id(1)).expect("open");
        let held = cache.close(id(1)).expect("close");

        assert!(cache.evict(id(1)));
        assert!(cache.get(id(1)).is_none());
        assert_eq!(held.beam_spot(Variant::Fit), Some(&sample_spot(0.3)));
        assert!(!cache.evict(id(1)));
    }

    #[test]
    fn test_evict_skips_open_window() {
        let (fitters, _, _) = counting_fitters(None, None);
        let cache = WindowCache::new(fitters);
        cache.open(id(1)).expect("open");
        assert!(!cache.evict(id(1)));
        assert!(cache.handle(id(1)).is_some());
    }

    #[test]
    fn test_snapshots_for_run_sorted_and_scoped() {
        let (fitters, _, _) = counting_fitters(None, None);
        let cache = WindowCache::new(fitters);
        for w in [3, 1, 2] {
            cache.open(id(w)).expect("open");
            cache.close(id(w)).expect("close");
        }
        cache.open(WindowId::new(2, 1)).expect("open other run");
        cache.close(WindowId::new(2, 1)).expect("close other run");
        cache.open(id(4)).expect("open but never closed");

        let ids: Vec<u32> = cache
            .snapshots_for_run(1)
            .iter()
            .map(|s| s.id.window)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(cache.open_windows(1), 1);
        assert_eq!(cache.open_windows(2), 0);
    }

    #[test]
    fn test_discard_and_evict_run() {
        let (fitters, beam, _) = counting_fitters(None, None);
        let cache = WindowCache::new(fitters);
        cache.open(id(1)).expect("open");
        cache.close(id(1)).expect("close");
        let open = cache.open(id(2)).expect("open");

        assert_eq!(cache.evict_run(1), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.discard_run(1), 1);
        assert!(cache.is_empty());
        assert!(open.with_accumulator(|_| ()).is_err());
        // The discarded open window was never fitted.
        assert_eq!(beam.calls(), 1);
    }

    #[test]
    fn test_concurrent_close_same_window_fits_once() {
        let (fitters, beam, vertex) = counting_fitters(Some(sample_spot(0.1)), None);
        let cache = Arc::new(WindowCache::new(fitters));
        cache.open(id(1)).expect("open");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.close(id(1)).expect("close"))
            })
            .collect();

        let snapshots: Vec<Arc<WindowSnapshot>> = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect();

        assert!(snapshots.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(beam.calls(), 1);
        assert_eq!(vertex.calls(), 1);
    }

    #[test]
    fn test_concurrent_close_distinct_windows() {
        let (fitters, beam, _) = counting_fitters(Some(sample_spot(0.1)), None);
        let cache = Arc::new(WindowCache::new(fitters));
        for w in 1..=16 {
            cache.open(id(w)).expect("open");
        }

        let handles: Vec<_> = (1..=16)
            .map(|w| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    cache.close(id(w)).expect("close");
                    cache.get(id(w)).expect("readable after close")
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread panicked");
        }

        assert_eq!(beam.calls(), 16);
        assert_eq!(cache.snapshots_for_run(1).len(), 16);
    }
}
