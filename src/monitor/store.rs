use std::collections::BTreeMap;
use std::fmt;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::beamspot::{Variable, Variant};

use super::error::{MonitorError, Result};

/// Aggregation axis of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// One point per window.
    ByWindow,
    /// One point per run.
    ByRun,
    /// One point per window, comparing two variants.
    Validation,
}

impl Category {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ByWindow => "by-window",
            Self::ByRun => "by-run",
            Self::Validation => "validation",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a series measures: one variant, or the difference of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Series {
    Variant(Variant),
    Difference(Variant, Variant),
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Variant(v) => f.write_str(v.as_str()),
            Self::Difference(a, b) => write!(f, "{a}-{b}"),
        }
    }
}

/// Address of one series: run, then variable, category and series.
///
/// Every run books its own slots. By-window and validation slots are indexed
/// by window number, by-run slots hold a single point indexed by the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub run: u32,
    pub variable: Variable,
    pub category: Category,
    pub series: Series,
}

impl SlotKey {
    pub const fn new(run: u32, variable: Variable, category: Category, series: Series) -> Self {
        Self {
            run,
            variable,
            category,
            series,
        }
    }

    pub const fn variant(
        run: u32,
        variable: Variable,
        category: Category,
        variant: Variant,
    ) -> Self {
        Self::new(run, variable, category, Series::Variant(variant))
    }

    /// `<variable>/<category>/<series>`, without the run.
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.variable, self.category, self.series)
    }

    fn same_series(&self, variable: Variable, category: Category, series: Series) -> bool {
        self.variable == variable && self.category == category && self.series == series
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run-{}/{}/{}/{}",
            self.run, self.variable, self.category, self.series
        )
    }
}

/// One point of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SlotPoint {
    pub index: u64,
    pub value: f64,
    pub error: f64,
}

/// Append-only series with strictly increasing indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSlot {
    points: Vec<SlotPoint>,
}

impl HistogramSlot {
    pub fn points(&self) -> &[SlotPoint] {
        &self.points
    }

    pub fn last_index(&self) -> Option<u64> {
        self.points.last().map(|p| p.index)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The last `n` points, oldest first.
    pub fn trailing(&self, n: usize) -> &[SlotPoint] {
        let start = self.points.len().saturating_sub(n);
        &self.points[start..]
    }

    fn check(&self, key: SlotKey, index: u64) -> Result<()> {
        match self.last_index() {
            Some(last) if index <= last => Err(MonitorError::OrderingViolation { key, last, index }),
            _ => Ok(()),
        }
    }

    fn push(&mut self, key: SlotKey, point: SlotPoint) -> Result<()> {
        self.check(key, point.index)?;
        self.points.push(point);
        Ok(())
    }
}

/// Categorized series container: variable -> category -> series -> points.
///
/// Appends to the same slot serialize on the slot's map entry; appends to
/// different slots proceed independently.
pub struct HistogramStore {
    slots: DashMap<SlotKey, HistogramSlot>,
    /// Serializes batch commits against each other.
    commit: Mutex<()>,
}

impl HistogramStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::with_capacity(128),
            commit: Mutex::new(()),
        }
    }

    /// Appends one point, creating the slot on first use.
    pub fn append(&self, key: SlotKey, index: u64, value: f64, error: f64) -> Result<()> {
        let _commit = self.commit.lock();
        self.slots
            .entry(key)
            .or_default()
            .push(key, SlotPoint {
                index,
                value,
                error,
            })
    }

    /// Appends a batch only if every point respects slot ordering. Returns
    /// the number of points appended.
    ///
    /// Single appends take the same lock, so slots cannot move between the
    /// validation pass and the commit loop.
    pub fn append_batch(&self, points: &[(SlotKey, SlotPoint)]) -> Result<usize> {
        let _commit = self.commit.lock();

        let mut grouped: BTreeMap<SlotKey, Vec<SlotPoint>> = BTreeMap::new();
        for (key, point) in points {
            grouped.entry(*key).or_default().push(*point);
        }

        for (key, group) in &grouped {
            let mut last = self.slots.get(key).and_then(|s| s.last_index());
            for point in group {
                if let Some(prev) = last {
                    if point.index <= prev {
                        return Err(MonitorError::OrderingViolation {
                            key: *key,
                            last: prev,
                            index: point.index,
                        });
                    }
                }
                last = Some(point.index);
            }
        }

        for (key, group) in grouped {
            let mut slot = self.slots.entry(key).or_default();
            for point in group {
                slot.push(key, point)?;
            }
        }

        Ok(points.len())
    }

    /// Returns a copy of the slot, empty if nothing was ever appended.
    pub fn get(&self, key: &SlotKey) -> HistogramSlot {
        self.slots
            .get(key)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    /// The last `n` points of a slot, for drift display.
    pub fn trailing(&self, key: &SlotKey, n: usize) -> Vec<SlotPoint> {
        self.slots
            .get(key)
            .map(|s| s.trailing(n).to_vec())
            .unwrap_or_default()
    }

    /// The last `n` points of one series across all runs, ordered by run
    /// and then index. For by-run series this is the run-to-run trend.
    pub fn trend(
        &self,
        variable: Variable,
        category: Category,
        series: Series,
        n: usize,
    ) -> Vec<SlotPoint> {
        let mut points: Vec<(u32, SlotPoint)> = self
            .slots
            .iter()
            .filter(|e| e.key().same_series(variable, category, series))
            .flat_map(|e| {
                let run = e.key().run;
                e.value()
                    .points()
                    .iter()
                    .map(move |p| (run, *p))
                    .collect::<Vec<_>>()
            })
            .collect();
        points.sort_by_key(|(run, p)| (*run, p.index));
        let start = points.len().saturating_sub(n);
        points.drain(start..).map(|(_, p)| p).collect()
    }

    /// Runs that have at least one slot, sorted.
    pub fn runs(&self) -> Vec<u32> {
        let mut runs: Vec<u32> = self.slots.iter().map(|e| e.key().run).collect();
        runs.sort_unstable();
        runs.dedup();
        runs
    }

    /// Every slot key of a variable, sorted.
    pub fn keys_for(&self, variable: Variable) -> Vec<SlotKey> {
        self.sorted_keys(|k| k.variable == variable)
    }

    /// Every slot key of a variable within one category, sorted.
    pub fn keys_in(&self, variable: Variable, category: Category) -> Vec<SlotKey> {
        self.sorted_keys(|k| k.variable == variable && k.category == category)
    }

    /// All slots, sorted by key.
    pub fn snapshot(&self) -> Vec<(SlotKey, HistogramSlot)> {
        let mut all: Vec<(SlotKey, HistogramSlot)> = self
            .slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(k, _)| *k);
        all
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn sorted_keys(&self, pred: impl Fn(&SlotKey) -> bool) -> Vec<SlotKey> {
        let mut keys: Vec<SlotKey> = self
            .slots
            .iter()
            .map(|e| *e.key())
            .filter(|k| pred(k))
            .collect();
        keys.sort();
        keys
    }
}

impl Default for HistogramStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HistogramStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistogramStore")
            .field("slots", &self.slots.len())
            .finish()
    }
}
