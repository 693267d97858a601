use thiserror::Error;

use super::store::SlotKey;
use super::window::WindowId;

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Structural failures of the monitor. Per-measurement problems never surface
/// here; they are dropped and counted at ingestion.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MonitorError {
    #[error("window {id} already opened")]
    DuplicateWindow { id: WindowId },

    #[error("window {id} was never opened or has been evicted")]
    UnknownWindow { id: WindowId },

    #[error("window {id} is closed")]
    WindowClosed { id: WindowId },

    #[error("out-of-order append to {key}: index {index} after {last}")]
    OrderingViolation { key: SlotKey, last: u64, index: u64 },

    #[error("run {run} already started")]
    RunAlreadyStarted { run: u32 },

    #[error("run {run} is not active")]
    RunNotActive { run: u32 },

    #[error("run {run} still has {open} open windows")]
    WindowsStillOpen { run: u32, open: usize },
}
