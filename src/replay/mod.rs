//! JSON-lines replay driver.
//!
//! Reads lifecycle records from a stream and drives a [`BeamMonitor`] with
//! them. Window closes run on the blocking pool so distinct windows close
//! concurrently; a run's end waits for that run's pending closes first.

pub mod parse;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::cache::WindowHandle;
use crate::monitor::error::MonitorError;
use crate::monitor::window::{WindowId, WindowSnapshot};
use crate::monitor::{BeamMonitor, RunReport};

pub use self::parse::{parse_line, ParseError, ReplayRecord};

type PendingClose = JoinHandle<crate::monitor::error::Result<Arc<WindowSnapshot>>>;

/// Result of a replay.
#[derive(Debug, Default)]
pub struct ReplayOutcome {
    pub reports: Vec<RunReport>,
    pub aborted_runs: Vec<u32>,
    pub parse_errors: usize,
    pub rejected_records: usize,
    pub cancelled: bool,
}

/// Opens a replay input; `-` reads standard input.
pub async fn open_input(path: &Path) -> Result<Box<dyn AsyncBufRead + Send + Unpin>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening replay input {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

pub struct Replayer {
    monitor: Arc<BeamMonitor>,
    cancel: CancellationToken,
    handles: HashMap<WindowId, WindowHandle>,
    pending: HashMap<u32, Vec<(WindowId, PendingClose)>>,
    outcome: ReplayOutcome,
}

impl Replayer {
    pub fn new(monitor: Arc<BeamMonitor>, cancel: CancellationToken) -> Self {
        Self {
            monitor,
            cancel,
            handles: HashMap::new(),
            pending: HashMap::new(),
            outcome: ReplayOutcome::default(),
        }
    }

    /// Consumes the input until EOF or cancellation. Runs still active at
    /// the end are aborted; they never produce a partial summary.
    pub async fn run<R>(mut self, input: R) -> Result<ReplayOutcome>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut line = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(line, "replay cancelled");
                    self.outcome.cancelled = true;
                    break;
                }
                next = lines.next_line() => next.context("reading replay input")?,
            };
            let Some(text) = next else {
                break;
            };
            line += 1;

            let record = match parse_line(line, &text) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, "skipping malformed replay line");
                    self.outcome.parse_errors += 1;
                    continue;
                }
            };

            let run = record.run();
            let window = record.window();
            if let Err(err) = self.apply(record).await {
                match window {
                    Some(id) => warn!(line, window = %id, error = %err, "replay record rejected"),
                    None => warn!(line, run, error = %err, "replay record rejected"),
                }
                self.outcome.rejected_records += 1;
            }
        }

        self.finish().await;
        Ok(self.outcome)
    }

    async fn apply(&mut self, record: ReplayRecord) -> Result<()> {
        match record {
            ReplayRecord::BeginRun { run } => self.monitor.begin_run(run)?,
            ReplayRecord::BeginWindow { run, window } => {
                let id = WindowId::new(run, window);
                let handle = self.monitor.begin_window(id)?;
                self.handles.insert(id, handle);
            }
            ReplayRecord::Event { run, window, event } => {
                let id = WindowId::new(run, window);
                let handle = self
                    .handles
                    .get(&id)
                    .ok_or(MonitorError::UnknownWindow { id })?;
                self.monitor.ingest(handle, &event)?;
            }
            ReplayRecord::EndWindow { run, window } => {
                let id = WindowId::new(run, window);
                // Later events for this window are rejected, not raced
                // against the close.
                self.handles.remove(&id);
                let monitor = Arc::clone(&self.monitor);
                let task = tokio::task::spawn_blocking(move || monitor.end_window(id));
                self.pending.entry(run).or_default().push((id, task));
            }
            ReplayRecord::EndRun { run } => {
                self.drain(run).await;
                let monitor = Arc::clone(&self.monitor);
                let report = tokio::task::spawn_blocking(move || monitor.end_run(run))
                    .await
                    .context("run aggregation task failed")??;
                self.handles.retain(|id, _| id.run != run);
                self.log_stats(run);
                self.outcome.reports.push(report);
            }
            ReplayRecord::AbortRun { run } => {
                self.drain(run).await;
                self.monitor.abort_run(run)?;
                self.handles.retain(|id, _| id.run != run);
                self.outcome.aborted_runs.push(run);
            }
        }
        Ok(())
    }

    /// Waits for the run's in-flight window closes.
    async fn drain(&mut self, run: u32) {
        let Some(tasks) = self.pending.remove(&run) else {
            return;
        };
        for (id, task) in tasks {
            match task.await {
                Ok(Ok(snapshot)) => debug!(
                    window = %id,
                    variants = snapshot.beam_spots.len(),
                    "window close finished",
                ),
                Ok(Err(err)) => {
                    warn!(window = %id, error = %err, "window close rejected");
                    self.outcome.rejected_records += 1;
                }
                Err(err) => {
                    warn!(window = %id, error = %err, "window close task failed");
                    self.outcome.rejected_records += 1;
                }
            }
        }
    }

    async fn finish(&mut self) {
        let runs: Vec<u32> = self.pending.keys().copied().collect();
        for run in runs {
            self.drain(run).await;
        }

        for run in self.monitor.active_runs() {
            if !self.outcome.cancelled {
                warn!(run, "input ended before the run did");
            }
            match self.monitor.abort_run(run) {
                Ok(_) => self.outcome.aborted_runs.push(run),
                Err(err) => warn!(run, error = %err, "failed to abort run"),
            }
        }
        self.handles.clear();
    }

    fn log_stats(&self, run: u32) {
        let snapshot = self.monitor.stats().snapshot();
        let total: u64 = snapshot.iter().map(|(_, n)| n).sum();
        if total == 0 {
            return;
        }

        info!(run, measurements = total, "ingest stats");
        for (kind, count) in &snapshot {
            debug!(kind = %kind, count, "  by kind");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Config;
    use crate::monitor::RunPhase;

    fn monitor() -> Arc<BeamMonitor> {
        let mut cfg = Config::default();
        cfg.fitters.min_vertices = 2;
        Arc::new(BeamMonitor::new(&cfg))
    }

    fn vertex_event(run: u32, window: u32, x: f64) -> String {
        format!(
            r#"{{"type":"event","run":{run},"window":{window},"event":{{"vertices":[{{"x":{x},"y":0.0,"z":{z},"x_error":0.002,"y_error":0.002,"z_error":0.01}}]}}}}"#,
            z = x * 10.0,
        )
    }

    fn window_lines(run: u32, window: u32) -> Vec<String> {
        let mut lines = vec![format!(
            r#"{{"type":"begin_window","run":{run},"window":{window}}}"#
        )];
        for i in 0..3 {
            lines.push(vertex_event(run, window, 0.001 * f64::from(i)));
        }
        lines.push(format!(
            r#"{{"type":"end_window","run":{run},"window":{window}}}"#
        ));
        lines
    }

    async fn replay(monitor: Arc<BeamMonitor>, lines: &[String]) -> ReplayOutcome {
        let input = lines.join("\n");
        Replayer::new(monitor, CancellationToken::new())
            .run(input.as_bytes())
            .await
            .expect("replay")
    }

    #[tokio::test]
    async fn test_replay_complete_run() {
        let m = monitor();
        let mut lines = vec![r#"{"type":"begin_run","run":1}"#.to_string()];
        for w in 1..=3 {
            lines.extend(window_lines(1, w));
        }
        lines.push(r#"{"type":"end_run","run":1}"#.to_string());

        let outcome = replay(Arc::clone(&m), &lines).await;
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].processed_windows.len(), 3);
        assert_eq!(outcome.parse_errors, 0);
        assert_eq!(outcome.rejected_records, 0);
        assert_eq!(m.run_phase(1), Some(RunPhase::Done));
        assert!(!m.store().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let m = monitor();
        let lines = vec![
            r#"{"type":"begin_run","run":2}"#.to_string(),
            "not json".to_string(),
            r#"{"type":"event","run":2,"window":9}"#.to_string(),
            r#"{"type":"end_run","run":2}"#.to_string(),
        ];
        let outcome = replay(m, &lines).await;
        assert_eq!(outcome.parse_errors, 1);
        // Event for a window that was never opened.
        assert_eq!(outcome.rejected_records, 1);
        assert_eq!(outcome.reports.len(), 1);
    }

    #[tokio::test]
    async fn test_unfinished_run_is_aborted() {
        let m = monitor();
        let mut lines = vec![r#"{"type":"begin_run","run":3}"#.to_string()];
        lines.extend(window_lines(3, 1));

        let outcome = replay(Arc::clone(&m), &lines).await;
        assert!(outcome.reports.is_empty());
        assert_eq!(outcome.aborted_runs, vec![3]);
        assert_eq!(m.run_phase(3), Some(RunPhase::Aborted));
        assert!(m.store().is_empty());
        assert!(m.cache().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_replay_commits_nothing() {
        let m = monitor();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let lines = [
            r#"{"type":"begin_run","run":4}"#,
            r#"{"type":"end_run","run":4}"#,
        ]
        .join("\n");
        let outcome = Replayer::new(Arc::clone(&m), cancel)
            .run(lines.as_bytes())
            .await
            .expect("replay");

        assert!(outcome.cancelled);
        assert!(outcome.reports.is_empty());
        assert!(m.store().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_abort_record() {
        let m = monitor();
        let mut lines = vec![r#"{"type":"begin_run","run":5}"#.to_string()];
        lines.extend(window_lines(5, 1));
        lines.push(r#"{"type":"abort_run","run":5}"#.to_string());
        lines.push(r#"{"type":"end_run","run":5}"#.to_string());

        let outcome = replay(Arc::clone(&m), &lines).await;
        assert_eq!(outcome.aborted_runs, vec![5]);
        // end_run after abort is rejected.
        assert_eq!(outcome.rejected_records, 1);
        assert!(m.store().is_empty());
    }

    #[tokio::test]
    async fn test_event_after_end_window_is_rejected() {
        let m = monitor();
        let lines = vec![
            r#"{"type":"begin_run","run":6}"#.to_string(),
            r#"{"type":"begin_window","run":6,"window":1}"#.to_string(),
            r#"{"type":"end_window","run":6,"window":1}"#.to_string(),
            vertex_event(6, 1, 0.001),
            vertex_event(6, 1, 0.002),
            vertex_event(6, 1, 0.003),
            r#"{"type":"end_run","run":6}"#.to_string(),
        ];

        let outcome = replay(Arc::clone(&m), &lines).await;
        assert_eq!(outcome.rejected_records, 3);
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].processed_windows.len(), 1);
        assert!(outcome.reports[0].beam_spots.is_empty());
        assert!(m.store().is_empty());
    }
}
