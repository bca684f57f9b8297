use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use serde::Serialize;
use vmr_core::events::{LogEvent, RunEvent};
use vmr_core::placeholder::dated_result_dir;
use vmr_core::types::sanitize_file_name;

use crate::event_sink::RunEventSink;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to log file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read log file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One JSON line per log event of a single scenario run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    /// `<result_root>/<yyyyMMdd>/<scenario>_<HHmmss>.jsonl`
    pub fn for_run(result_root: &Path, scenario_name: &str, started: DateTime<Local>) -> Self {
        let file = format!(
            "{}_{}.jsonl",
            sanitize_file_name(scenario_name),
            started.format("%H%M%S")
        );
        Self::at(dated_result_dir(result_root, started).join(file))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure_layout(&self) -> Result<(), EventLogError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| EventLogError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn append(&self, event: &LogEvent) -> Result<(), EventLogError> {
        append_json_line(&self.path, event)
    }

    pub fn read_all(&self) -> Result<Vec<LogEvent>, EventLogError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| EventLogError::Read {
            path: self.path.clone(),
            source,
        })?;
        let mut events = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let event = serde_json::from_str(line)
                .map_err(|source| EventLogError::Serialize { source })?;
            events.push(event);
        }
        Ok(events)
    }
}

/// Appends every log event to a [`RunLog`]. Progress events are not persisted.
#[derive(Debug)]
pub struct JsonlSink {
    log: RunLog,
    failed: Mutex<bool>,
}

impl JsonlSink {
    pub fn create(log: RunLog) -> Result<Self, EventLogError> {
        log.ensure_layout()?;
        Ok(Self {
            log,
            failed: Mutex::new(false),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }
}

impl RunEventSink for JsonlSink {
    fn emit(&self, event: RunEvent) {
        let RunEvent::Log(event) = event else {
            return;
        };
        if let Err(err) = self.log.append(&event) {
            let mut failed = self
                .failed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Report the first failure only.
            if !*failed {
                *failed = true;
                tracing::warn!(error = %err, "run log append failed");
            }
        }
    }
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<(), EventLogError> {
    let mut line =
        serde_json::to_string(value).map_err(|source| EventLogError::Serialize { source })?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(line.as_bytes())
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })
}
