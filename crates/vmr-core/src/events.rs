use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Initializing,
    RevertingSnapshot,
    WaitingForBoot,
    CopyingFiles,
    ExecutingTest,
    CollectingResults,
    Completed,
    Failed,
}

impl ProgressPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressPhase::Initializing => "initializing",
            ProgressPhase::RevertingSnapshot => "reverting_snapshot",
            ProgressPhase::WaitingForBoot => "waiting_for_boot",
            ProgressPhase::CopyingFiles => "copying_files",
            ProgressPhase::ExecutingTest => "executing_test",
            ProgressPhase::CollectingResults => "collecting_results",
            ProgressPhase::Completed => "completed",
            ProgressPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 1-based; 0 before any step starts.
    pub current_step: usize,
    pub total_steps: usize,
    pub step_name: String,
    pub vm_name: String,
    pub phase: ProgressPhase,
}

impl ProgressEvent {
    pub fn progress_percent(&self) -> u8 {
        if self.total_steps == 0 {
            return 0;
        }
        let percent = self.current_step.min(self.total_steps) * 100 / self.total_steps;
        percent as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub vm_name: Option<String>,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            message: message.into(),
            vm_name: None,
        }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn with_vm(mut self, vm_name: impl Into<String>) -> Self {
        self.vm_name = Some(vm_name.into());
        self
    }
}

impl std::fmt::Display for LogEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] [{}]",
            self.at.format("%H:%M:%S"),
            self.level.as_str().to_uppercase()
        )?;
        if let Some(vm) = &self.vm_name {
            write!(f, " [{vm}]")?;
        }
        write!(f, " {}", self.message)
    }
}

/// Everything a run reports to its observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Progress(ProgressEvent),
    Log(LogEvent),
}
