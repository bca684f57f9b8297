//! Observers for a run's progress and log events.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use vmr_core::events::{LogEvent, LogLevel, ProgressEvent, RunEvent};

pub trait RunEventSink: Send + Sync {
    fn emit(&self, event: RunEvent);

    fn log(&self, event: LogEvent) {
        self.emit(RunEvent::Log(event));
    }

    fn progress(&self, event: ProgressEvent) {
        self.emit(RunEvent::Progress(event));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl RunEventSink for NullSink {
    fn emit(&self, _event: RunEvent) {}
}

/// Forwards events to an unbounded channel. Dropped receivers are ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl RunEventSink for ChannelSink {
    fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        lock(&self.events).clone()
    }

    pub fn logs(&self) -> Vec<LogEvent> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                RunEvent::Log(log) => Some(log.clone()),
                RunEvent::Progress(_) => None,
            })
            .collect()
    }

    pub fn progress_events(&self) -> Vec<ProgressEvent> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                RunEvent::Progress(progress) => Some(progress.clone()),
                RunEvent::Log(_) => None,
            })
            .collect()
    }

    pub fn has_log_containing(&self, level: LogLevel, needle: &str) -> bool {
        self.logs()
            .iter()
            .any(|log| log.level == level && log.message.contains(needle))
    }
}

impl RunEventSink for RecordingSink {
    fn emit(&self, event: RunEvent) {
        lock(&self.events).push(event);
    }
}

/// Sends each event to every inner sink, in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn RunEventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn RunEventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn RunEventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl RunEventSink for FanoutSink {
    fn emit(&self, event: RunEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleTarget {
    Stdout,
    Stderr,
}

/// Prints log lines and phase changes for the CLI.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleSink {
    pub min_level: LogLevel,
    pub target: ConsoleTarget,
    pub show_progress: bool,
}

impl ConsoleSink {
    pub fn new(min_level: LogLevel, target: ConsoleTarget) -> Self {
        Self {
            min_level,
            target,
            show_progress: true,
        }
    }

    pub fn render(&self, event: &RunEvent) -> Option<String> {
        match event {
            RunEvent::Log(log) if log.level >= self.min_level => Some(log.to_string()),
            RunEvent::Progress(progress) if self.show_progress => Some(format!(
                "[{}/{}] {} ({}) {} {}%",
                progress.current_step,
                progress.total_steps,
                progress.step_name,
                progress.vm_name,
                progress.phase,
                progress.progress_percent()
            )),
            _ => None,
        }
    }
}

impl RunEventSink for ConsoleSink {
    fn emit(&self, event: RunEvent) {
        let Some(line) = self.render(&event) else {
            return;
        };
        let _ = match self.target {
            ConsoleTarget::Stdout => writeln!(std::io::stdout().lock(), "{line}"),
            ConsoleTarget::Stderr => writeln!(std::io::stderr().lock(), "{line}"),
        };
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
