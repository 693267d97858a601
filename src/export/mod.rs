use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::monitor::store::SlotPoint;
use crate::monitor::{BeamMonitor, RunReport};
use crate::replay::ReplayOutcome;

/// One store series, addressed by its three-level path.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesExport {
    /// `<monitor>/run-<run>/<variable>/<category>/<series>`.
    pub path: String,
    pub run: u32,
    pub variable: String,
    pub category: String,
    pub series: String,
    pub points: Vec<SlotPoint>,
}

/// Everything a replay produced.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub monitor: String,
    pub runs: Vec<RunReport>,
    pub aborted_runs: Vec<u32>,
    pub parse_errors: usize,
    pub rejected_records: usize,
    pub cancelled: bool,
    pub series: Vec<SeriesExport>,
}

impl Report {
    pub fn build(monitor: &BeamMonitor, outcome: ReplayOutcome) -> Self {
        let name = monitor.config().name.clone();
        let series = monitor
            .store()
            .snapshot()
            .into_iter()
            .map(|(key, slot)| SeriesExport {
                path: format!("{name}/{key}"),
                run: key.run,
                variable: key.variable.to_string(),
                category: key.category.to_string(),
                series: key.series.to_string(),
                points: slot.points().to_vec(),
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            monitor: name,
            runs: outcome.reports,
            aborted_runs: outcome.aborted_runs,
            parse_errors: outcome.parse_errors,
            rejected_records: outcome.rejected_records,
            cancelled: outcome.cancelled,
            series,
        }
    }

    /// Writes the report as pretty JSON to `output`, or to stdout.
    pub async fn write(&self, output: Option<&Path>) -> Result<()> {
        let mut body = serde_json::to_vec_pretty(self).context("serializing report")?;
        body.push(b'\n');

        match output {
            Some(path) => {
                tokio::fs::write(path, &body)
                    .await
                    .with_context(|| format!("writing report to {}", path.display()))?;
                tracing::info!(
                    path = %path.display(),
                    series = self.series.len(),
                    "report written",
                );
            }
            None => {
                let mut stdout = tokio::io::stdout();
                stdout
                    .write_all(&body)
                    .await
                    .context("writing report to stdout")?;
                stdout.flush().await.context("flushing stdout")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::beamspot::{Variable, Variant};
    use crate::config::Config;
    use crate::monitor::store::{Category, SlotKey};
    use crate::monitor::window::WindowId;

    #[test]
    fn test_report_lists_series_with_paths() {
        let m = BeamMonitor::new(&Config::default());
        let key = SlotKey::variant(1, Variable::X, Category::ByRun, Variant::Scaler);
        m.store().append(key, 1, 0.1, 0.01).expect("append");

        let report = Report::build(&m, ReplayOutcome::default());
        assert_eq!(report.monitor, "beamwatch");
        assert_eq!(report.series.len(), 1);
        assert_eq!(report.series[0].path, "beamwatch/run-1/x/by-run/scaler");
        assert_eq!(report.series[0].run, 1);
        assert_eq!(report.series[0].points.len(), 1);
    }

    #[test]
    fn test_report_serializes_run_reports() {
        let m = BeamMonitor::new(&Config::default());
        m.begin_run(1).expect("begin");
        let id = WindowId::new(1, 1);
        m.begin_window(id).expect("open");
        m.end_window(id).expect("close");
        let run = m.end_run(1).expect("end");

        let outcome = ReplayOutcome {
            reports: vec![run],
            ..Default::default()
        };
        let json = serde_json::to_value(Report::build(&m, outcome)).expect("serialize");
        assert_eq!(json["runs"][0]["run"], 1);
        assert_eq!(json["runs"][0]["processed_windows"][0]["window"], 1);
        assert!(json["generated_at"].is_string());
    }

    #[tokio::test]
    async fn test_write_to_file() {
        let m = BeamMonitor::new(&Config::default());
        let report = Report::build(&m, ReplayOutcome::default());
        let path = std::env::temp_dir()
            .join(format!("beamwatch-report-{}.json", std::process::id()));

        report.write(Some(&path)).await.expect("write");
        let text = tokio::fs::read_to_string(&path).await.expect("read back");
        let _ = tokio::fs::remove_file(&path).await;

        let json: serde_json::Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(json["monitor"], "beamwatch");
        assert_eq!(json["series"].as_array().map(Vec::len), Some(0));
    }
}
