use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use beamwatch::config::Config;
use beamwatch::export::Report;
use beamwatch::monitor::BeamMonitor;
use beamwatch::replay::{self, Replayer};

/// Luminosity-window beam spot monitor.
#[derive(Parser)]
#[command(name = "beamwatch", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// the configured level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a JSON-lines lifecycle stream through the monitor.
    Replay {
        /// Input file, or `-` for stdin.
        input: PathBuf,

        /// Write the JSON report here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (input, output) = match cli.command {
        Command::Version => {
            println!("beamwatch {}", version::full());
            return Ok(());
        }
        Command::Replay { input, output } => (input, output),
    };

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    // Logs go to stderr so a report on stdout stays machine-readable.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        monitor = %cfg.monitor.name,
        "starting beamwatch",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg, input, output))
}

async fn run(cfg: Config, input: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let monitor = Arc::new(BeamMonitor::new(&cfg));
    let reader = replay::open_input(&input).await?;
    let outcome = Replayer::new(Arc::clone(&monitor), cancel)
        .run(reader)
        .await
        .with_context(|| format!("replaying {}", input.display()))?;

    tracing::info!(
        runs = outcome.reports.len(),
        aborted = outcome.aborted_runs.len(),
        parse_errors = outcome.parse_errors,
        rejected = outcome.rejected_records,
        "replay finished",
    );

    Report::build(&monitor, outcome)
        .write(output.as_deref())
        .await?;

    tracing::info!("beamwatch stopped");

    Ok(())
}

/// Cancels the replay on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to register SIGTERM handler");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("received SIGINT, aborting active runs");
                        cancel.cancel();
                    }
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, aborting active runs");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, aborting active runs");
            }
            _ = cancel.cancelled() => return,
        }

        cancel.cancel();
    });
}
