//! Runs a scenario: pre-hook, step dispatch, post-hook.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use vmr_core::config::VmInfo;
use vmr_core::events::LogEvent;
use vmr_core::result::{ScenarioResult, StepResult, StepStatus};
use vmr_core::scenario::{Scenario, ScenarioEvent, Step};
use vmr_hook::HookRunner;
use vmr_notify::{NoopNotifier, Notifier};
use vmr_vm::VmControl;

use crate::condition::{evaluate_condition, ConditionVerdict};
use crate::event_sink::RunEventSink;
use crate::executor::{ExecutorConfig, StepExecutor, StepPosition};
use crate::registry::VmRegistry;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("a scenario run is already in progress")]
    AlreadyRunning,
}

pub struct ScenarioOrchestrator {
    vm: Arc<dyn VmControl>,
    executor: StepExecutor,
    hooks: HookRunner,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn RunEventSink>,
    registry: VmRegistry,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

/// Clears the single-flight flag and the run's token on every exit path.
struct RunGuard<'a> {
    orchestrator: &'a ScenarioOrchestrator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        lock(&self.orchestrator.cancel).take();
        self.orchestrator.running.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn needs_attention(status: StepStatus) -> bool {
    status == StepStatus::Failed || status.is_error_like()
}

impl ScenarioOrchestrator {
    pub fn new(
        vm: Arc<dyn VmControl>,
        events: Arc<dyn RunEventSink>,
        registry: VmRegistry,
        config: ExecutorConfig,
    ) -> Self {
        let hooks = HookRunner::new(&config.result_root);
        let executor = StepExecutor::new(vm.clone(), events.clone(), registry.clone(), config);
        Self {
            vm,
            executor,
            hooks,
            notifier: Arc::new(NoopNotifier),
            events,
            registry,
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    pub fn with_hooks(mut self, hooks: HookRunner) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops future step starts of the current run. No-op when idle.
    pub fn cancel(&self) {
        if let Some(token) = lock(&self.cancel).as_ref() {
            if !token.is_cancelled() {
                self.log(LogEvent::warning("cancellation requested"));
            }
            token.cancel();
        }
    }

    pub async fn run(&self, scenario: &Scenario) -> Result<ScenarioResult, OrchestratorError> {
        self.run_with_cancel(scenario, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), observing an external token as well as [`cancel`](Self::cancel).
    pub async fn run_with_cancel(
        &self,
        scenario: &Scenario,
        cancel: CancellationToken,
    ) -> Result<ScenarioResult, OrchestratorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyRunning);
        }
        *lock(&self.cancel) = Some(cancel.clone());
        let _guard = RunGuard { orchestrator: self };
        Ok(self.drive(scenario, &cancel).await)
    }

    async fn drive(&self, scenario: &Scenario, cancel: &CancellationToken) -> ScenarioResult {
        let mut result = ScenarioResult::start(scenario);
        self.log(LogEvent::info(format!(
            "scenario '{}' started: {} steps, max_parallel {}",
            scenario.name,
            scenario.steps.len(),
            scenario.max_parallel
        )));
        self.notifier.on_scenario_started(scenario).await;

        if let Some(pre) = enabled(&scenario.pre_event) {
            let outcome = self
                .hooks
                .run_with_cancel(pre, &scenario.name, None, cancel)
                .await;
            result.pre_hook = Some(outcome.report());
            if outcome.cancelled {
                self.mark_cancelled(&mut result, scenario.steps.len());
                result.finish();
                self.notifier.on_scenario_completed(&result).await;
                return result;
            }
            if outcome.success {
                self.log(LogEvent::info("pre-hook succeeded"));
            } else {
                let message = outcome.error_message.unwrap_or_default();
                self.log(LogEvent::warning(format!("pre-hook failed: {message}")));
                if pre.stop_on_failure {
                    self.log(LogEvent::error(
                        "scenario stopped: pre-hook failed and stop_on_failure is set",
                    ));
                    result.finish();
                    self.notifier.on_scenario_completed(&result).await;
                    return result;
                }
            }
        }

        if !self.vm.is_connected() {
            if let Err(err) = self.vm.connect().await {
                let message = format!("VM control connect failed: {}", err.failure_message());
                self.log(LogEvent::error(message.clone()));
                self.notifier.on_error(&message).await;
                result.fault = Some(message);
                result.finish();
                self.run_post_hook(scenario, &mut result, true, cancel)
                    .await;
                self.notifier.on_scenario_completed(&result).await;
                return result;
            }
        }

        let steps: Vec<Step> = scenario.ordered_steps().into_iter().cloned().collect();
        if scenario.is_parallel() {
            self.run_parallel(scenario, steps, cancel, &mut result)
                .await;
        } else {
            self.run_sequential(scenario, steps, cancel, &mut result)
                .await;
        }

        result.finish();
        self.log(LogEvent::info(format!(
            "scenario '{}' finished: {} passed, {} failed, {} skipped, {} errors",
            scenario.name,
            result.passed_count(),
            result.failed_count(),
            result.skipped_count(),
            result.error_count()
        )));

        self.run_post_hook(scenario, &mut result, false, cancel)
            .await;
        self.notifier.on_scenario_completed(&result).await;
        result
    }

    async fn run_sequential(
        &self,
        scenario: &Scenario,
        steps: Vec<Step>,
        cancel: &CancellationToken,
        result: &mut ScenarioResult,
    ) {
        let total = steps.len();
        for (index, step) in steps.into_iter().enumerate() {
            if cancel.is_cancelled() {
                self.mark_cancelled(result, total - index);
                break;
            }
            let info = self.registry.resolve(&step.vm);

            if let ConditionVerdict::Skip { reason } =
                evaluate_condition(step.condition.as_ref(), &result.step_results)
            {
                self.log(
                    LogEvent::info(format!("step '{}' skipped: {reason}", step.name))
                        .with_vm(&info.name),
                );
                result
                    .step_results
                    .push(StepResult::skipped(&step, info.name, reason));
                continue;
            }

            let position = StepPosition::new(index + 1, total);
            let stop = !scenario.continue_on_failure;
            let step_result = self.spawn_step(step, info, position).await;
            if needs_attention(step_result.status) {
                self.notifier.on_step_failed(&step_result).await;
            }
            let failed = step_result.status == StepStatus::Failed;
            let name = step_result.step_name.clone();
            result.step_results.push(step_result);

            if failed && stop && index + 1 < total {
                self.log(LogEvent::warning(format!(
                    "stopping after '{name}' failed: continue_on_failure is off"
                )));
                break;
            }
        }
    }

    async fn run_parallel(
        &self,
        scenario: &Scenario,
        steps: Vec<Step>,
        cancel: &CancellationToken,
        result: &mut ScenarioResult,
    ) {
        let total = steps.len();
        let gate = Arc::new(Semaphore::new(scenario.max_parallel));
        let collected: Arc<Mutex<Vec<StepResult>>> = Arc::new(Mutex::new(Vec::with_capacity(total)));
        let mut in_flight = Vec::with_capacity(total);

        for (index, step) in steps.into_iter().enumerate() {
            let info = self.registry.resolve(&step.vm);
            if step
                .condition
                .as_ref()
                .is_some_and(|condition| !condition.is_always())
            {
                self.log(
                    LogEvent::warning(format!(
                        "step '{}' condition ignored in parallel mode",
                        step.name
                    ))
                    .with_vm(&info.name),
                );
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.mark_cancelled(result, total - index);
                    break;
                }
                permit = gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let executor = self.executor.clone();
            let notifier = self.notifier.clone();
            let collected = collected.clone();
            let fallback = (step.clone(), info.clone());
            let position = StepPosition::new(index + 1, total);
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let step_result = executor.run_step(&step, &info, position).await;
                if needs_attention(step_result.status) {
                    notifier.on_step_failed(&step_result).await;
                }
                lock(&collected).push(step_result);
            });
            in_flight.push((fallback, handle));
        }

        for ((step, info), handle) in in_flight {
            if let Err(err) = handle.await {
                let step_result = self.task_failed(&step, info, err);
                self.notifier.on_step_failed(&step_result).await;
                lock(&collected).push(step_result);
            }
        }
        result.step_results = std::mem::take(&mut *lock(&collected));
    }

    /// Runs one step on its own task so a panic becomes an error result.
    async fn spawn_step(&self, step: Step, info: VmInfo, position: StepPosition) -> StepResult {
        let executor = self.executor.clone();
        let task_step = step.clone();
        let task_info = info.clone();
        let handle =
            tokio::spawn(async move { executor.run_step(&task_step, &task_info, position).await });
        match handle.await {
            Ok(step_result) => step_result,
            Err(err) => self.task_failed(&step, info, err),
        }
    }

    fn task_failed(&self, step: &Step, info: VmInfo, err: JoinError) -> StepResult {
        let message = format!("step task failed: {err}");
        self.log(
            LogEvent::error(format!("step '{}': {message}", step.name)).with_vm(&info.name),
        );
        let mut step_result = StepResult::pending(step, info.name);
        step_result.status = StepStatus::Error;
        step_result.ended_at = Some(Utc::now());
        step_result.error_message = Some(message);
        step_result
    }

    fn mark_cancelled(&self, result: &mut ScenarioResult, remaining: usize) {
        result.cancelled = true;
        self.log(LogEvent::warning(format!(
            "run cancelled: {remaining} step(s) not started"
        )));
    }

    async fn run_post_hook(
        &self,
        scenario: &Scenario,
        result: &mut ScenarioResult,
        after_fault: bool,
        cancel: &CancellationToken,
    ) {
        let Some(post) = enabled(&scenario.post_event) else {
            return;
        };
        let due = if after_fault {
            post.run_condition.runs_after_fault()
        } else {
            post.run_condition.is_satisfied(result.failed_count())
        };
        if !due {
            self.log(LogEvent::debug(format!(
                "post-hook not run: condition {:?} not met",
                post.run_condition
            )));
            return;
        }
        if cancel.is_cancelled() {
            self.log(LogEvent::warning("post-hook not run: run cancelled"));
            return;
        }

        let outcome = self
            .hooks
            .run_with_cancel(post, &scenario.name, Some(&*result), cancel)
            .await;
        if outcome.success {
            self.log(LogEvent::info("post-hook succeeded"));
        } else {
            self.log(LogEvent::warning(format!(
                "post-hook failed: {}",
                outcome.error_message.as_deref().unwrap_or_default()
            )));
        }
        result.post_hook = Some(outcome.report());
    }

    fn log(&self, event: LogEvent) {
        self.events.log(event);
    }
}

fn enabled(event: &Option<ScenarioEvent>) -> Option<&ScenarioEvent> {
    event.as_ref().filter(|event| event.enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sink::RecordingSink;
    use async_trait::async_trait;
    use std::time::Duration;
    use vmr_core::criteria::SuccessCriteria;
    use vmr_core::events::LogLevel;
    use vmr_core::scenario::{ConditionKind, Execution, HookKind, RunCondition, StepCondition};
    use vmr_core::types::VmRef;
    use vmr_vm::{GuestProcessOutput, InMemoryVm, VmOperation};

    #[derive(Default)]
    struct CountingNotifier {
        started: Mutex<usize>,
        completed: Mutex<usize>,
        step_failures: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn on_scenario_started(&self, _scenario: &Scenario) {
            *lock(&self.started) += 1;
        }
        async fn on_scenario_completed(&self, _result: &ScenarioResult) {
            *lock(&self.completed) += 1;
        }
        async fn on_step_failed(&self, result: &StepResult) {
            lock(&self.step_failures).push(result.step_name.clone());
        }
        async fn on_error(&self, message: &str) {
            lock(&self.errors).push(message.to_string());
        }
    }

    struct Harness {
        vm: Arc<InMemoryVm>,
        sink: Arc<RecordingSink>,
        notifier: Arc<CountingNotifier>,
        orchestrator: ScenarioOrchestrator,
        root: tempfile::TempDir,
    }

    fn harness_with(vm: InMemoryVm) -> Harness {
        let root = tempfile::tempdir().expect("create temp dir");
        let vm = Arc::new(vm);
        let sink = Arc::new(RecordingSink::new());
        let notifier = Arc::new(CountingNotifier::default());
        let orchestrator = ScenarioOrchestrator::new(
            vm.clone(),
            sink.clone(),
            VmRegistry::default(),
            ExecutorConfig {
                result_root: root.path().to_path_buf(),
                boot_timeout_secs: 30,
            },
        )
        .with_notifier(notifier.clone());
        Harness {
            vm,
            sink,
            notifier,
            orchestrator,
            root,
        }
    }

    fn harness() -> Harness {
        harness_with(InMemoryVm::connected())
    }

    fn step(name: &str, order: i32) -> Step {
        let mut step = Step::new(
            name,
            VmRef::new(format!("D:\\VMs\\{name}\\{name}.vmx")),
            "clean",
            Execution::program(format!("C:\\tests\\{name}.exe")),
        )
        .with_order(order)
        .with_id(name);
        step.success_criteria = SuccessCriteria::exit_code(0);
        step
    }

    fn scenario(steps: Vec<Step>) -> Scenario {
        let mut scenario = Scenario::new("Regression");
        scenario.steps = steps;
        scenario
    }

    fn names(result: &ScenarioResult) -> Vec<&str> {
        result
            .step_results
            .iter()
            .map(|step| step.step_name.as_str())
            .collect()
    }

    fn fail_program(vm: &InMemoryVm, name: &str) {
        vm.set_output(
            format!("C:\\tests\\{name}.exe"),
            GuestProcessOutput::exited(1, ""),
        );
    }

    #[tokio::test]
    async fn sequential_run_follows_declared_order() {
        let h = harness();
        let scenario = scenario(vec![step("c", 3), step("a", 1), step("b", 2)]);

        let result = h.orchestrator.run(&scenario).await.expect("run");

        assert_eq!(names(&result), vec!["a", "b", "c"]);
        assert!(result.is_success());
        assert!(result.ended_at.is_some());
        assert!(!h.orchestrator.is_running());
        assert_eq!(*lock(&h.notifier.started), 1);
        assert_eq!(*lock(&h.notifier.completed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_run_respects_max_parallel() {
        let h = harness();
        h.vm.set_program_delay(Duration::from_millis(300));
        let mut scenario = scenario(vec![step("a", 1), step("b", 2), step("c", 3)]);
        scenario.max_parallel = 2;

        let started = std::time::Instant::now();
        let result = h.orchestrator.run(&scenario).await.expect("run");
        let elapsed = started.elapsed();

        assert_eq!(result.total_count(), 3);
        assert_eq!(result.passed_count(), 3);
        assert_eq!(h.vm.peak_concurrent_programs(), 2);
        // two waves of 300ms instead of three back to back
        assert!(elapsed >= Duration::from_millis(600));
        assert!(elapsed < Duration::from_millis(850), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn failed_step_stops_run_when_continue_on_failure_is_off() {
        let h = harness();
        fail_program(&h.vm, "b");
        let mut scenario = scenario(vec![step("a", 1), step("b", 2), step("c", 3), step("d", 4)]);
        scenario.continue_on_failure = false;

        let result = h.orchestrator.run(&scenario).await.expect("run");

        assert_eq!(names(&result), vec!["a", "b"]);
        assert_eq!(result.failed_count(), 1);
        assert!(!result.is_success());
        assert_eq!(*lock(&h.notifier.step_failures), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn failed_step_does_not_stop_run_by_default() {
        let h = harness();
        fail_program(&h.vm, "a");
        let scenario = scenario(vec![step("a", 1), step("b", 2)]);

        let result = h.orchestrator.run(&scenario).await.expect("run");

        assert_eq!(names(&result), vec!["a", "b"]);
        assert_eq!(result.passed_count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_pre_hook_stops_before_any_step() {
        let h = harness();
        let mut scenario = scenario(vec![step("a", 1)]);
        scenario.pre_event = Some(ScenarioEvent::new(HookKind::Command, "exit 4"));
        let marker = h.root.path().join("post.txt");
        scenario.post_event = Some(ScenarioEvent::new(
            HookKind::Command,
            format!("touch '{}'", marker.display()),
        ));

        let result = h.orchestrator.run(&scenario).await.expect("run");

        assert_eq!(result.total_count(), 0);
        assert!(result.ended_at.is_some());
        let pre = result.pre_hook.expect("pre-hook report");
        assert!(!pre.success);
        assert_eq!(pre.exit_code, Some(4));
        assert!(result.post_hook.is_none());
        assert!(!marker.exists());
        assert_eq!(h.vm.count(VmOperation::Revert), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_pre_hook_without_stop_on_failure_continues() {
        let h = harness();
        let mut scenario = scenario(vec![step("a", 1)]);
        let mut pre = ScenarioEvent::new(HookKind::Command, "exit 1");
        pre.stop_on_failure = false;
        scenario.pre_event = Some(pre);

        let result = h.orchestrator.run(&scenario).await.expect("run");

        assert_eq!(result.passed_count(), 1);
        assert!(h.sink.has_log_containing(LogLevel::Warning, "pre-hook failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn on_failure_post_hook_is_not_run_for_clean_run() {
        let h = harness();
        let marker = h.root.path().join("post.txt");
        let mut scenario = scenario(vec![step("a", 1)]);
        let mut post = ScenarioEvent::new(
            HookKind::Command,
            format!("touch '{}'", marker.display()),
        );
        post.run_condition = RunCondition::OnFailure;
        scenario.post_event = Some(post);

        let result = h.orchestrator.run(&scenario).await.expect("run");

        assert_eq!(result.failed_count(), 0);
        assert!(result.post_hook.is_none());
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn on_failure_post_hook_runs_with_result_macros() {
        let h = harness();
        fail_program(&h.vm, "b");
        let marker = h.root.path().join("post.txt");
        let mut scenario = scenario(vec![step("a", 1), step("b", 2)]);
        let mut post = ScenarioEvent::new(
            HookKind::Command,
            format!("echo {{FailedCount}}/{{TotalCount}} > '{}'", marker.display()),
        );
        post.run_condition = RunCondition::OnFailure;
        scenario.post_event = Some(post);

        let result = h.orchestrator.run(&scenario).await.expect("run");

        assert!(result.post_hook.as_ref().is_some_and(|report| report.success));
        let written = std::fs::read_to_string(&marker).expect("read marker");
        assert_eq!(written.trim(), "1/2");
    }

    #[tokio::test]
    async fn second_concurrent_run_is_rejected() {
        let h = harness();
        h.vm.set_program_delay(Duration::from_millis(300));
        let scenario = scenario(vec![step("a", 1)]);

        let (first, second) = tokio::join!(h.orchestrator.run(&scenario), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.orchestrator.run(&scenario).await
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(OrchestratorError::AlreadyRunning)));
        assert!(!h.orchestrator.is_running());
        assert!(h.orchestrator.run(&scenario).await.is_ok());
    }

    #[tokio::test]
    async fn connect_failure_is_fatal_with_empty_result() {
        let vm = InMemoryVm::new();
        vm.fail_on(VmOperation::Connect);
        let h = harness_with(vm);
        let scenario = scenario(vec![step("a", 1), step("b", 2)]);

        let result = h.orchestrator.run(&scenario).await.expect("run");

        assert_eq!(result.total_count(), 0);
        assert!(result
            .fault
            .as_deref()
            .is_some_and(|fault| fault.contains("connect failed")));
        assert_eq!(lock(&h.notifier.errors).len(), 1);
        assert!(h.sink.has_log_containing(LogLevel::Error, "connect failed"));
    }

    #[tokio::test]
    async fn disconnected_control_is_connected_before_steps() {
        let h = harness_with(InMemoryVm::new());
        let scenario = scenario(vec![step("a", 1)]);

        let result = h.orchestrator.run(&scenario).await.expect("run");

        assert_eq!(result.passed_count(), 1);
        assert_eq!(h.vm.operations().first(), Some(&VmOperation::Connect));
    }

    #[tokio::test]
    async fn unmet_condition_records_skipped_step() {
        let h = harness();
        fail_program(&h.vm, "build");
        let mut deploy = step("deploy", 2);
        deploy.condition = Some(StepCondition::of(ConditionKind::PreviousPassed));
        let mut report = step("report", 3);
        report.condition = Some(StepCondition::of(ConditionKind::AnyPreviousFailed));
        let scenario = scenario(vec![step("build", 1), deploy, report]);

        let result = h.orchestrator.run(&scenario).await.expect("run");

        let statuses: Vec<StepStatus> = result.step_results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Failed, StepStatus::Skipped, StepStatus::Passed]
        );
        assert_eq!(result.skipped_count(), 1);
        assert!(result.step_results[1]
            .error_message
            .as_deref()
            .is_some_and(|reason| reason.contains("previous_passed")));
    }

    #[tokio::test]
    async fn cancelled_token_prevents_step_starts() {
        let h = harness();
        let scenario = scenario(vec![step("a", 1), step("b", 2)]);
        let token = CancellationToken::new();
        token.cancel();

        let result = h
            .orchestrator
            .run_with_cancel(&scenario, token)
            .await
            .expect("run");

        assert_eq!(result.total_count(), 0);
        assert!(result.cancelled);
        assert_eq!(h.vm.count(VmOperation::RunProgram), 0);
    }

    #[tokio::test]
    async fn cancel_during_run_lets_in_flight_step_finish() {
        let h = harness();
        h.vm.set_program_delay(Duration::from_millis(300));
        let scenario = scenario(vec![step("a", 1), step("b", 2), step("c", 3)]);

        let (result, ()) = tokio::join!(h.orchestrator.run(&scenario), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.orchestrator.cancel();
            h.orchestrator.cancel();
        });
        let result = result.expect("run");

        assert_eq!(names(&result), vec!["a"]);
        assert_eq!(result.passed_count(), 1);
        assert!(result.cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_unblocks_parallel_steps_waiting_for_a_slot() {
        let h = harness();
        h.vm.set_program_delay(Duration::from_millis(300));
        let mut scenario = scenario(vec![step("a", 1), step("b", 2), step("c", 3), step("d", 4)]);
        scenario.max_parallel = 2;
        let token = CancellationToken::new();

        let started = std::time::Instant::now();
        let (result, ()) = tokio::join!(
            h.orchestrator.run_with_cancel(&scenario, token.clone()),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel();
            }
        );
        let result = result.expect("run");

        assert!(result.cancelled);
        assert_eq!(result.total_count(), 2);
        assert_eq!(result.passed_count(), 2);
        let mut ran = names(&result);
        ran.sort_unstable();
        assert_eq!(ran, vec!["a", "b"]);
        assert_eq!(h.vm.count(VmOperation::RunProgram), 2);
        assert!(started.elapsed() < Duration::from_millis(550));
        assert!(!h.orchestrator.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_during_pre_hook_marks_run_cancelled() {
        for stop_on_failure in [true, false] {
            let h = harness();
            let mut scenario = scenario(vec![step("a", 1)]);
            let mut pre = ScenarioEvent::new(HookKind::Command, "sleep 5");
            pre.stop_on_failure = stop_on_failure;
            scenario.pre_event = Some(pre);

            let started = std::time::Instant::now();
            let (result, ()) = tokio::join!(h.orchestrator.run(&scenario), async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                h.orchestrator.cancel();
            });
            let result = result.expect("run");

            assert!(result.cancelled);
            assert_eq!(result.total_count(), 0);
            assert!(result.ended_at.is_some());
            assert!(result
                .pre_hook
                .as_ref()
                .is_some_and(|report| !report.success));
            assert_eq!(crate::summary::RunExit::for_result(&result).code(), 5);
            assert_eq!(h.vm.count(VmOperation::RunProgram), 0);
            assert!(started.elapsed() < Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn cancel_when_idle_is_a_no_op() {
        let h = harness();
        h.orchestrator.cancel();
        let result = h
            .orchestrator
            .run(&scenario(vec![step("a", 1)]))
            .await
            .expect("run");
        assert!(!result.cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parallel_step_failure_does_not_affect_siblings() {
        let h = harness();
        h.vm.fail_on_vm(VmOperation::PowerOn, &VmRef::new("D:\\VMs\\b\\b.vmx"));
        let mut scenario = scenario(vec![step("a", 1), step("b", 2), step("c", 3)]);
        scenario.max_parallel = 3;

        let result = h.orchestrator.run(&scenario).await.expect("run");

        assert_eq!(result.total_count(), 3);
        assert_eq!(result.passed_count(), 2);
        assert_eq!(result.error_count(), 1);
        assert!(!result.is_success());
    }
}
