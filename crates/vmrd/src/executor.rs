//! Drives one step through its VM lifecycle and produces its result.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use vmr_core::config::{Settings, VmInfo, DEFAULT_BOOT_TIMEOUT_SECS};
use vmr_core::criteria::evaluate;
use vmr_core::events::{LogEvent, ProgressEvent};
use vmr_core::placeholder::{dated_result_dir, ResultPathContext};
use vmr_core::result::{StepResult, StepStatus};
use vmr_core::scenario::{ExecutionKind, FileCopy, Step};
use vmr_core::types::{sanitize_file_name, VmRef};
use vmr_vm::{guest_parent_dir, GuestProcessOutput, GuestProgram, VmControl, VmError};

use crate::event_sink::RunEventSink;
use crate::phase::{PhaseError, PhaseTracker, StepPhase};
use crate::registry::VmRegistry;

/// Guest shell used for script steps.
pub const SCRIPT_INTERPRETER: &str = "cmd.exe";

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("failed to revert to snapshot '{snapshot}': {}", .source.failure_message())]
    Revert {
        snapshot: String,
        #[source]
        source: VmError,
    },
    #[error("failed to power on VM: {}", .source.failure_message())]
    PowerOn {
        #[source]
        source: VmError,
    },
    #[error("guest not ready within {timeout_secs}s: {}", .source.failure_message())]
    GuestNotReady {
        timeout_secs: u64,
        #[source]
        source: VmError,
    },
    #[error("guest login as '{username}' failed: {}", .source.failure_message())]
    Login {
        username: String,
        #[source]
        source: VmError,
    },
    #[error("failed to copy {host} to guest {guest}: {}", .source.failure_message())]
    CopyIn {
        host: String,
        guest: String,
        #[source]
        source: VmError,
    },
    #[error(transparent)]
    Phase(#[from] PhaseError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub result_root: PathBuf,
    pub boot_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            result_root: PathBuf::from("results"),
            boot_timeout_secs: DEFAULT_BOOT_TIMEOUT_SECS,
        }
    }
}

impl ExecutorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            result_root: settings.result_root.clone(),
            boot_timeout_secs: settings.boot_timeout_secs,
        }
    }
}

/// 1-based position of a step within its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPosition {
    pub index: usize,
    pub total: usize,
}

impl StepPosition {
    pub fn new(index: usize, total: usize) -> Self {
        Self { index, total }
    }
}

#[derive(Clone)]
pub struct StepExecutor {
    vm: Arc<dyn VmControl>,
    events: Arc<dyn RunEventSink>,
    registry: VmRegistry,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(
        vm: Arc<dyn VmControl>,
        events: Arc<dyn RunEventSink>,
        registry: VmRegistry,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            vm,
            events,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Never fails: every fault ends up in the returned result.
    pub async fn run_step(&self, step: &Step, vm: &VmInfo, position: StepPosition) -> StepResult {
        let mut run = StepRun::new(self, step, vm, position);
        run.result.started_at = Some(Utc::now());
        run.result.status = StepStatus::Running;
        run.emit_progress(StepPhase::Initializing);
        self.log(LogEvent::info(format!("step '{}' started", step.name)).with_vm(&vm.name));

        if let Err(err) = run.drive().await {
            run.result.status = StepStatus::Error;
            run.result.error_message = Some(err.to_string());
            self.log(LogEvent::error(format!("step '{}': {err}", step.name)).with_vm(&vm.name));
        }

        if step.force_snapshot_revert_after && run.reverted {
            run.settle(StepPhase::RevertingAfter);
            self.revert_after(step, vm).await;
        }

        run.result.ended_at = Some(Utc::now());
        let passed = run.result.status == StepStatus::Passed;
        run.settle(if passed {
            StepPhase::Completed
        } else {
            StepPhase::Failed
        });

        let summary = format!(
            "step '{}' finished: {} ({}s)",
            step.name,
            run.result.status,
            run.result.duration().num_seconds()
        );
        if passed {
            self.log(LogEvent::info(summary).with_vm(&vm.name));
        } else {
            self.log(LogEvent::error(summary).with_vm(&vm.name));
        }
        run.result
    }

    /// Best-effort cleanup revert. Returns whether it succeeded.
    pub async fn revert_after(&self, step: &Step, vm: &VmInfo) -> bool {
        match self
            .vm
            .revert_to_snapshot(&step.vm, &step.snapshot_name)
            .await
        {
            Ok(()) => {
                self.log(
                    LogEvent::debug(format!("reverted to '{}' after step", step.snapshot_name))
                        .with_vm(&vm.name),
                );
                true
            }
            Err(err) => {
                self.log(
                    LogEvent::warning(format!(
                        "revert to '{}' after step failed: {}",
                        step.snapshot_name,
                        err.failure_message()
                    ))
                    .with_vm(&vm.name),
                );
                false
            }
        }
    }

    fn log(&self, event: LogEvent) {
        self.events.log(event);
    }
}

struct StepRun<'a> {
    executor: &'a StepExecutor,
    step: &'a Step,
    vm: &'a VmInfo,
    position: StepPosition,
    tracker: PhaseTracker,
    reverted: bool,
    result_dir: PathBuf,
    result: StepResult,
}

impl<'a> StepRun<'a> {
    fn new(
        executor: &'a StepExecutor,
        step: &'a Step,
        vm: &'a VmInfo,
        position: StepPosition,
    ) -> Self {
        let result_dir = step_result_dir(&executor.config.result_root, &step.name, Local::now());
        Self {
            executor,
            step,
            vm,
            position,
            tracker: PhaseTracker::default(),
            reverted: false,
            result_dir,
            result: StepResult::pending(step, vm.name.clone()),
        }
    }

    fn emit_progress(&self, phase: StepPhase) {
        self.executor.events.progress(ProgressEvent {
            current_step: self.position.index,
            total_steps: self.position.total,
            step_name: self.step.name.clone(),
            vm_name: self.vm.name.clone(),
            phase: phase.progress_phase(),
        });
    }

    fn enter(&mut self, phase: StepPhase) -> Result<(), StepError> {
        self.tracker.advance(phase)?;
        self.emit_progress(phase);
        Ok(())
    }

    /// Transition used on the cleanup path, where a bad edge is only worth a trace.
    fn settle(&mut self, phase: StepPhase) {
        if let Err(err) = self.enter(phase) {
            tracing::warn!(step = %self.step.name, error = %err, "unexpected phase transition");
        }
    }

    fn log(&self, event: LogEvent) {
        self.executor.log(event.with_vm(&self.vm.name));
    }

    async fn drive(&mut self) -> Result<(), StepError> {
        let executor = self.executor;
        let control = executor.vm.as_ref();
        let step = self.step;
        let vm_ref = &step.vm;

        self.enter(StepPhase::Reverting)?;
        control
            .revert_to_snapshot(vm_ref, &step.snapshot_name)
            .await
            .map_err(|source| StepError::Revert {
                snapshot: step.snapshot_name.clone(),
                source,
            })?;
        self.reverted = true;

        self.enter(StepPhase::Booting)?;
        control
            .power_on(vm_ref)
            .await
            .map_err(|source| StepError::PowerOn { source })?;
        let timeout_secs = self.executor.config.boot_timeout_secs;
        control
            .wait_for_guest_ready(vm_ref, timeout_secs)
            .await
            .map_err(|source| StepError::GuestNotReady {
                timeout_secs,
                source,
            })?;

        self.enter(StepPhase::LoggingIn)?;
        let (username, password) = self.executor.registry.credentials(self.vm);
        control
            .login_guest(vm_ref, &username, &password)
            .await
            .map_err(|source| StepError::Login {
                username: username.clone(),
                source,
            })?;

        self.enter(StepPhase::CopyingIn)?;
        for file in &step.files_to_copy {
            if let Some(parent) = guest_parent_dir(&file.destination) {
                if let Err(err) = control.create_guest_directory(vm_ref, parent).await {
                    tracing::debug!(dir = parent, error = %err, "guest directory not created");
                }
            }
            control
                .copy_to_guest(vm_ref, Path::new(&file.source), &file.destination)
                .await
                .map_err(|source| StepError::CopyIn {
                    host: file.source.clone(),
                    guest: file.destination.clone(),
                    source,
                })?;
            self.log(LogEvent::debug(format!(
                "copied {} to {}",
                file.source, file.destination
            )));
        }

        self.enter(StepPhase::Executing)?;
        if step.force_network_disconnect {
            if let Err(err) = control.disconnect_network(vm_ref).await {
                self.log(LogEvent::warning(format!(
                    "network disconnect failed: {}",
                    err.failure_message()
                )));
            }
        }
        let timed_out = self.execute().await;

        self.enter(StepPhase::Collecting)?;
        self.collect().await;

        if step.capture_screenshots {
            self.enter(StepPhase::Screenshot)?;
            self.final_screenshot().await;
        }

        if timed_out {
            self.result.status = StepStatus::Timeout;
            return Ok(());
        }

        self.enter(StepPhase::Evaluating)?;
        let passed = evaluate(
            Some(&step.success_criteria),
            self.result.exit_code,
            self.result.output.as_deref(),
        );
        if passed {
            self.result.status = StepStatus::Passed;
        } else {
            self.result.status = StepStatus::Failed;
            self.result.note_error("success criteria not met");
        }
        Ok(())
    }

    /// Runs the configured command. Returns true when it hit its timeout.
    async fn execute(&mut self) -> bool {
        let executor = self.executor;
        let control = executor.vm.as_ref();
        let step = self.step;
        let execution = &step.execution;
        self.log(LogEvent::info(format!(
            "executing {} {} {}",
            execution.kind, execution.path, execution.arguments
        )));

        let invocation = async {
            match execution.kind {
                ExecutionKind::Script => {
                    let script = format!("/c \"{}\" {}", execution.path, execution.arguments);
                    control
                        .run_script_in_guest(
                            &step.vm,
                            SCRIPT_INTERPRETER,
                            script.trim_end(),
                            execution.timeout_secs,
                        )
                        .await
                }
                ExecutionKind::Program | ExecutionKind::Command => {
                    let program = GuestProgram {
                        program: execution.path.clone(),
                        arguments: execution.arguments.clone(),
                        timeout_secs: execution.timeout_secs,
                        wait_for_exit: execution.wait_for_exit,
                    };
                    control.run_program_in_guest(&step.vm, &program).await
                }
            }
        };

        let outcome = if step.capture_screenshots && step.screenshot_interval_secs > 0 {
            if let Err(err) = std::fs::create_dir_all(&self.result_dir) {
                tracing::warn!(path = %self.result_dir.display(), error = %err, "result directory not created");
            }
            let (outcome, shots) = with_periodic_screenshots(
                control,
                &step.vm,
                &self.result_dir,
                &screenshot_prefix(&self.vm.name, &step.name),
                Duration::from_secs(step.screenshot_interval_secs),
                invocation,
            )
            .await;
            self.result.screenshots.extend(shots);
            outcome
        } else {
            invocation.await
        };

        match outcome {
            Ok(output) => {
                self.record_output(output);
                false
            }
            Err(err) if err.is_timeout() => {
                self.log(LogEvent::warning(format!(
                    "execution timed out after {}s",
                    execution.timeout_secs
                )));
                self.result.note_error(err.to_string());
                true
            }
            Err(err) => {
                self.log(LogEvent::error(format!(
                    "execution failed: {}",
                    err.failure_message()
                )));
                self.result.note_error(err.failure_message());
                false
            }
        }
    }

    fn record_output(&mut self, output: GuestProcessOutput) {
        self.result.exit_code = output.exit_code;
        if !output.success {
            let text = output
                .error_message
                .clone()
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| output.stderr.trim().to_string());
            if !text.is_empty() {
                self.result.note_error(text);
            }
        }
        self.result.output = Some(output.stdout);
    }

    async fn collect(&mut self) {
        if self.step.result_files.is_empty() {
            return;
        }
        if let Err(err) = std::fs::create_dir_all(&self.result_dir) {
            self.log(LogEvent::warning(format!(
                "failed to create result directory {}: {err}",
                self.result_dir.display()
            )));
        }
        let context = ResultPathContext {
            result_dir: self.result_dir.clone(),
            vm_name: self.vm.name.clone(),
            step_name: self.step.name.clone(),
            captured_at: Local::now(),
        };
        let executor = self.executor;
        let control = executor.vm.as_ref();
        for file in &self.step.result_files {
            let destination = host_destination(file, &context);
            match control
                .copy_from_guest(&self.step.vm, &file.source, &destination)
                .await
            {
                Ok(()) => {
                    self.log(LogEvent::debug(format!(
                        "collected {} to {}",
                        file.source,
                        destination.display()
                    )));
                    self.result.result_files.push(destination);
                }
                Err(err) => self.log(LogEvent::warning(format!(
                    "result file {} not collected: {}",
                    file.source,
                    err.failure_message()
                ))),
            }
        }
    }

    async fn final_screenshot(&mut self) {
        if let Err(err) = std::fs::create_dir_all(&self.result_dir) {
            tracing::warn!(path = %self.result_dir.display(), error = %err, "result directory not created");
        }
        let path = self.result_dir.join(format!(
            "{}_final.png",
            screenshot_prefix(&self.vm.name, &self.step.name)
        ));
        match self
            .executor
            .vm
            .capture_screenshot(&self.step.vm, &path)
            .await
        {
            Ok(()) => self.result.screenshots.push(path),
            Err(err) => self.log(LogEvent::warning(format!(
                "screenshot failed: {}",
                err.failure_message()
            ))),
        }
    }
}

/// `<result_root>/<yyyyMMdd>/<step name>`
pub fn step_result_dir(result_root: &Path, step_name: &str, at: DateTime<Local>) -> PathBuf {
    dated_result_dir(result_root, at).join(sanitize_file_name(step_name))
}

fn screenshot_prefix(vm_name: &str, step_name: &str) -> String {
    sanitize_file_name(&format!("{vm_name}_{step_name}"))
}

/// Expanded host path for a collected file. An empty or directory-like
/// destination keeps the guest file name.
fn host_destination(file: &FileCopy, context: &ResultPathContext) -> PathBuf {
    let expanded = context.expand(file.destination.trim());
    if expanded.is_empty() {
        return context.result_dir.join(guest_file_name(&file.source));
    }
    let path = PathBuf::from(&expanded);
    if expanded.ends_with('/') || expanded.ends_with('\\') || path.is_dir() {
        return path.join(guest_file_name(&file.source));
    }
    path
}

fn guest_file_name(guest_path: &str) -> String {
    guest_path
        .rsplit(|c: char| c == '\\' || c == '/')
        .find(|part| !part.is_empty())
        .map(sanitize_file_name)
        .unwrap_or_else(|| "result".to_string())
}

async fn with_periodic_screenshots<T, F>(
    control: &dyn VmControl,
    vm: &VmRef,
    dir: &Path,
    prefix: &str,
    every: Duration,
    work: F,
) -> (T, Vec<PathBuf>)
where
    F: Future<Output = T>,
{
    tokio::pin!(work);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shots = Vec::new();
    loop {
        tokio::select! {
            output = &mut work => return (output, shots),
            _ = ticker.tick() => {
                let path = dir.join(format!("{prefix}_{:03}.png", shots.len() + 1));
                match control.capture_screenshot(vm, &path).await {
                    Ok(()) => shots.push(path),
                    Err(err) => tracing::debug!(error = %err, "periodic screenshot failed"),
                }
            }
        }
    }
}
