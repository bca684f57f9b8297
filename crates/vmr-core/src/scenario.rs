//! Scenario documents: steps, executions, hooks and step conditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::criteria::SuccessCriteria;
use crate::result::StepStatus;
use crate::types::{ScenarioId, StepId, VmRef};

pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SCREENSHOT_INTERVAL_SECS: u64 = 10;

fn default_true() -> bool {
    true
}

fn default_max_parallel() -> usize {
    1
}

fn default_exec_timeout() -> u64 {
    DEFAULT_EXEC_TIMEOUT_SECS
}

fn default_hook_timeout() -> u64 {
    DEFAULT_HOOK_TIMEOUT_SECS
}

fn default_screenshot_interval() -> u64 {
    DEFAULT_SCREENSHOT_INTERVAL_SECS
}

/// A named, ordered collection of steps plus optional pre/post hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub id: ScenarioId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// 1 runs steps sequentially.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_true")]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub pre_event: Option<ScenarioEvent>,
    #[serde(default)]
    pub post_event: Option<ScenarioEvent>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ScenarioId::generate(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            max_parallel: 1,
            continue_on_failure: true,
            pre_event: None,
            post_event: None,
            created_at: Utc::now(),
            last_run_at: None,
        }
    }

    /// Steps in ascending `order`; ties keep their position in `steps`.
    pub fn ordered_steps(&self) -> Vec<&Step> {
        let mut ordered: Vec<&Step> = self.steps.iter().collect();
        ordered.sort_by_key(|step| step.order);
        ordered
    }

    pub fn is_parallel(&self) -> bool {
        self.max_parallel > 1
    }

    pub fn find_step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|step| &step.id == id)
    }
}

/// A host path paired with a guest path. Direction depends on where it is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCopy {
    pub source: String,
    pub destination: String,
}

impl FileCopy {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    #[default]
    Program,
    Script,
    Command,
}

impl ExecutionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionKind::Program => "program",
            ExecutionKind::Script => "script",
            ExecutionKind::Command => "command",
        }
    }
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to run inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    #[serde(default)]
    pub kind: ExecutionKind,
    pub path: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub wait_for_exit: bool,
}

impl Execution {
    pub fn program(path: impl Into<String>) -> Self {
        Self {
            kind: ExecutionKind::Program,
            path: path.into(),
            arguments: String::new(),
            working_dir: None,
            timeout_secs: DEFAULT_EXEC_TIMEOUT_SECS,
            wait_for_exit: true,
        }
    }

    pub fn script(path: impl Into<String>) -> Self {
        Self {
            kind: ExecutionKind::Script,
            ..Self::program(path)
        }
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    #[default]
    Always,
    PreviousPassed,
    PreviousFailed,
    SpecificStepResult,
    AllPreviousPassed,
    AnyPreviousFailed,
}

impl ConditionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionKind::Always => "always",
            ConditionKind::PreviousPassed => "previous_passed",
            ConditionKind::PreviousFailed => "previous_failed",
            ConditionKind::SpecificStepResult => "specific_step_result",
            ConditionKind::AllPreviousPassed => "all_previous_passed",
            ConditionKind::AnyPreviousFailed => "any_previous_failed",
        }
    }
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_expected_result() -> StepStatus {
    StepStatus::Passed
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCondition {
    #[serde(default)]
    pub kind: ConditionKind,
    #[serde(default)]
    pub reference_step_id: Option<StepId>,
    #[serde(default = "default_expected_result")]
    pub expected_result: StepStatus,
}

impl StepCondition {
    pub fn always() -> Self {
        Self::of(ConditionKind::Always)
    }

    pub fn of(kind: ConditionKind) -> Self {
        Self {
            kind,
            reference_step_id: None,
            expected_result: StepStatus::Passed,
        }
    }

    pub fn specific(reference: StepId, expected: StepStatus) -> Self {
        Self {
            kind: ConditionKind::SpecificStepResult,
            reference_step_id: Some(reference),
            expected_result: expected,
        }
    }

    pub fn is_always(&self) -> bool {
        self.kind == ConditionKind::Always
    }
}

/// One unit of work against one target VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: StepId,
    pub name: String,
    #[serde(default)]
    pub order: i32,
    pub vm: VmRef,
    pub snapshot_name: String,
    #[serde(default)]
    pub files_to_copy: Vec<FileCopy>,
    pub execution: Execution,
    #[serde(default)]
    pub result_files: Vec<FileCopy>,
    #[serde(default)]
    pub success_criteria: SuccessCriteria,
    #[serde(default = "default_true")]
    pub force_network_disconnect: bool,
    #[serde(default)]
    pub capture_screenshots: bool,
    #[serde(default = "default_screenshot_interval")]
    pub screenshot_interval_secs: u64,
    #[serde(default = "default_true")]
    pub force_snapshot_revert_after: bool,
    #[serde(default)]
    pub condition: Option<StepCondition>,
}

impl Step {
    pub fn new(
        name: impl Into<String>,
        vm: VmRef,
        snapshot_name: impl Into<String>,
        execution: Execution,
    ) -> Self {
        Self {
            id: StepId::generate(),
            name: name.into(),
            order: 0,
            vm,
            snapshot_name: snapshot_name.into(),
            files_to_copy: Vec::new(),
            execution,
            result_files: Vec::new(),
            success_criteria: SuccessCriteria::default(),
            force_network_disconnect: true,
            capture_screenshots: false,
            screenshot_interval_secs: DEFAULT_SCREENSHOT_INTERVAL_SECS,
            force_snapshot_revert_after: true,
            condition: None,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = StepId::new(id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    #[default]
    Command,
    InterpreterScript,
    BatchFile,
    Executable,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::Command => "command",
            HookKind::InterpreterScript => "interpreter_script",
            HookKind::BatchFile => "batch_file",
            HookKind::Executable => "executable",
        }
    }
}

impl std::str::FromStr for HookKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "command" => Ok(HookKind::Command),
            "interpreter_script" | "powershell" => Ok(HookKind::InterpreterScript),
            "batch_file" | "batch" => Ok(HookKind::BatchFile),
            "executable" => Ok(HookKind::Executable),
            other => Err(format!(
                "invalid hook kind '{other}'. valid values: command, interpreter_script, batch_file, executable"
            )),
        }
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a post-hook runs, judged against the failed-step count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunCondition {
    #[default]
    Always,
    OnSuccess,
    OnFailure,
}

impl RunCondition {
    pub fn is_satisfied(self, failed_count: usize) -> bool {
        match self {
            RunCondition::Always => true,
            RunCondition::OnSuccess => failed_count == 0,
            RunCondition::OnFailure => failed_count > 0,
        }
    }

    /// Conditions under which the post-hook still runs after a run fault.
    pub fn runs_after_fault(self) -> bool {
        matches!(self, RunCondition::Always | RunCondition::OnFailure)
    }
}

/// Host-side command run before or after a scenario's steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioEvent {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub kind: HookKind,
    pub command: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub hide_window: bool,
    /// Pre-hooks only.
    #[serde(default = "default_true")]
    pub stop_on_failure: bool,
    /// Post-hooks only.
    #[serde(default)]
    pub run_condition: RunCondition,
}

impl ScenarioEvent {
    pub fn new(kind: HookKind, command: impl Into<String>) -> Self {
        Self {
            enabled: true,
            kind,
            command: command.into(),
            arguments: String::new(),
            working_dir: None,
            timeout_secs: DEFAULT_HOOK_TIMEOUT_SECS,
            env: BTreeMap::new(),
            hide_window: true,
            stop_on_failure: true,
            run_condition: RunCondition::Always,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, order: i32) -> Step {
        Step::new(name, VmRef::new("vm.vmx"), "clean", Execution::program("a.exe"))
            .with_order(order)
    }

    #[test]
    fn ordered_steps_sort_by_order_and_keep_ties_stable() {
        let mut scenario = Scenario::new("Regression");
        scenario.steps = vec![step("c", 30), step("a1", 10), step("b", 20), step("a2", 10)];

        let names: Vec<&str> = scenario
            .ordered_steps()
            .iter()
            .map(|step| step.name.as_str())
            .collect();
        assert_eq!(names, vec!["a1", "a2", "b", "c"]);
    }

    #[test]
    fn run_condition_matches_failed_count() {
        assert!(RunCondition::Always.is_satisfied(0));
        assert!(RunCondition::Always.is_satisfied(3));
        assert!(RunCondition::OnSuccess.is_satisfied(0));
        assert!(!RunCondition::OnSuccess.is_satisfied(1));
        assert!(RunCondition::OnFailure.is_satisfied(2));
        assert!(!RunCondition::OnFailure.is_satisfied(0));
        assert!(!RunCondition::OnSuccess.runs_after_fault());
    }

    #[test]
    fn minimal_step_document_fills_defaults() {
        let step: Step = serde_json::from_str(
            r#"{
                "name": "install",
                "vm": "D:\\VMs\\win10.vmx",
                "snapshot_name": "clean",
                "execution": { "path": "C:\\test\\setup.exe" }
            }"#,
        )
        .expect("parse step");

        assert!(step.id.0.starts_with("step-"));
        assert_eq!(step.execution.kind, ExecutionKind::Program);
        assert_eq!(step.execution.timeout_secs, 300);
        assert!(step.execution.wait_for_exit);
        assert!(step.force_network_disconnect);
        assert!(step.force_snapshot_revert_after);
        assert!(!step.capture_screenshots);
        assert_eq!(step.screenshot_interval_secs, 10);
        assert!(step.condition.is_none());
    }

    #[test]
    fn scenario_document_parses_hooks_and_conditions() {
        let scenario: Scenario = serde_json::from_str(
            r#"{
                "name": "Nightly",
                "max_parallel": 2,
                "continue_on_failure": false,
                "pre_event": { "enabled": true, "kind": "batch_file", "command": "prep.bat" },
                "post_event": {
                    "enabled": true,
                    "kind": "interpreter_script",
                    "command": "report.ps1",
                    "run_condition": "on_failure",
                    "env": { "TARGET": "{ScenarioName}" }
                },
                "steps": [{
                    "id": "s2",
                    "name": "verify",
                    "vm": "vm.vmx",
                    "snapshot_name": "clean",
                    "execution": { "kind": "script", "path": "C:\\run.bat" },
                    "condition": {
                        "kind": "specific_step_result",
                        "reference_step_id": "s1",
                        "expected_result": "failed"
                    }
                }]
            }"#,
        )
        .expect("parse scenario");

        assert!(scenario.is_parallel());
        assert!(!scenario.continue_on_failure);
        let pre = scenario.pre_event.expect("pre event");
        assert_eq!(pre.kind, HookKind::BatchFile);
        assert!(pre.stop_on_failure);
        assert_eq!(pre.timeout_secs, 300);
        let post = scenario.post_event.expect("post event");
        assert_eq!(post.run_condition, RunCondition::OnFailure);
        assert_eq!(post.env.get("TARGET").map(String::as_str), Some("{ScenarioName}"));
        let condition = scenario.steps[0].condition.clone().expect("condition");
        assert_eq!(condition.kind, ConditionKind::SpecificStepResult);
        assert_eq!(condition.reference_step_id, Some(StepId::new("s1")));
        assert_eq!(condition.expected_result, StepStatus::Failed);
    }

    #[test]
    fn hook_kind_parses_aliases() {
        assert_eq!("PowerShell".parse::<HookKind>(), Ok(HookKind::InterpreterScript));
        assert_eq!("batch".parse::<HookKind>(), Ok(HookKind::BatchFile));
        assert!("nope".parse::<HookKind>().is_err());
    }
}
