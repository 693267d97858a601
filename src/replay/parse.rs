use serde::Deserialize;
use thiserror::Error;

use crate::event::EventRecord;
use crate::monitor::window::WindowId;

/// One lifecycle record of a replay stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayRecord {
    BeginRun {
        run: u32,
    },
    BeginWindow {
        run: u32,
        window: u32,
    },
    Event {
        run: u32,
        window: u32,
        #[serde(default)]
        event: EventRecord,
    },
    EndWindow {
        run: u32,
        window: u32,
    },
    EndRun {
        run: u32,
    },
    AbortRun {
        run: u32,
    },
}

impl ReplayRecord {
    pub fn run(&self) -> u32 {
        match self {
            Self::BeginRun { run }
            | Self::BeginWindow { run, .. }
            | Self::Event { run, .. }
            | Self::EndWindow { run, .. }
            | Self::EndRun { run }
            | Self::AbortRun { run } => *run,
        }
    }

    /// The window a record addresses, if any.
    pub fn window(&self) -> Option<WindowId> {
        match self {
            Self::BeginWindow { run, window }
            | Self::Event { run, window, .. }
            | Self::EndWindow { run, window } => Some(WindowId::new(*run, *window)),
            _ => None,
        }
    }
}

/// A replay line that is not a valid record.
#[derive(Debug, Error)]
#[error("line {line}: {source}")]
pub struct ParseError {
    pub line: usize,
    #[source]
    pub source: serde_json::Error,
}

/// Parses one input line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: usize, text: &str) -> Result<Option<ReplayRecord>, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|source| ParseError { line, source })
}
