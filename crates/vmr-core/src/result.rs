//! Step and scenario results.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::scenario::{Scenario, Step};
use crate::types::{ScenarioId, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
    Timeout,
    Error,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Passed => "passed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Timeout => "timeout",
            StepStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// Error and timeout both count against the error tally.
    pub fn is_error_like(self) -> bool {
        matches!(self, StepStatus::Error | StepStatus::Timeout)
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "passed" => Ok(StepStatus::Passed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            "timeout" => Ok(StepStatus::Timeout),
            "error" => Ok(StepStatus::Error),
            other => Err(format!(
                "invalid step status '{other}'. valid values: pending, running, passed, failed, skipped, timeout, error"
            )),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub step_name: String,
    pub vm_name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub screenshots: Vec<PathBuf>,
    #[serde(default)]
    pub result_files: Vec<PathBuf>,
}

impl StepResult {
    pub fn pending(step: &Step, vm_name: impl Into<String>) -> Self {
        Self {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            vm_name: vm_name.into(),
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            exit_code: None,
            output: None,
            error_message: None,
            screenshots: Vec::new(),
            result_files: Vec::new(),
        }
    }

    pub fn skipped(step: &Step, vm_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            status: StepStatus::Skipped,
            started_at: Some(now),
            ended_at: Some(now),
            error_message: Some(reason.into()),
            ..Self::pending(step, vm_name)
        }
    }

    /// Zero until the step has both started and ended.
    pub fn duration(&self) -> Duration {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) if end > start => end - start,
            _ => Duration::zero(),
        }
    }

    /// Set the message only if nothing was recorded yet.
    pub fn note_error(&mut self, message: impl Into<String>) {
        if self.error_message.is_none() {
            self.error_message = Some(message.into());
        }
    }
}

/// How a pre/post hook went, kept on the scenario result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookReport {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario_id: ScenarioId,
    pub scenario_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub pre_hook: Option<HookReport>,
    #[serde(default)]
    pub post_hook: Option<HookReport>,
    /// Run-level fault that cut the run short, if any.
    #[serde(default)]
    pub fault: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ScenarioResult {
    pub fn start(scenario: &Scenario) -> Self {
        Self {
            scenario_id: scenario.id.clone(),
            scenario_name: scenario.name.clone(),
            started_at: Utc::now(),
            ended_at: None,
            step_results: Vec::new(),
            pre_hook: None,
            post_hook: None,
            fault: None,
            cancelled: false,
        }
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    pub fn total_count(&self) -> usize {
        self.step_results.len()
    }

    pub fn passed_count(&self) -> usize {
        self.count_where(|status| status == StepStatus::Passed)
    }

    pub fn failed_count(&self) -> usize {
        self.count_where(|status| status == StepStatus::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count_where(|status| status == StepStatus::Skipped)
    }

    pub fn error_count(&self) -> usize {
        self.count_where(StepStatus::is_error_like)
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0 && self.error_count() == 0
    }

    pub fn duration(&self) -> Duration {
        match self.ended_at {
            Some(end) if end > self.started_at => end - self.started_at,
            _ => Duration::zero(),
        }
    }

    fn count_where(&self, predicate: impl Fn(StepStatus) -> bool) -> usize {
        self.step_results
            .iter()
            .filter(|result| predicate(result.status))
            .count()
    }
}

/// `hh:mm:ss`, hours not wrapped at 24.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Execution;
    use crate::types::VmRef;
    use proptest::prelude::*;

    fn result_with(statuses: &[StepStatus]) -> ScenarioResult {
        let scenario = Scenario::new("Regression");
        let mut result = ScenarioResult::start(&scenario);
        for (index, status) in statuses.iter().enumerate() {
            let step = Step::new(
                format!("step-{index}"),
                VmRef::new("vm.vmx"),
                "clean",
                Execution::program("a.exe"),
            );
            let mut step_result = StepResult::pending(&step, "vm");
            step_result.status = *status;
            result.step_results.push(step_result);
        }
        result
    }

    fn any_status() -> impl Strategy<Value = StepStatus> {
        use StepStatus::*;
        prop::sample::select(vec![Pending, Running, Passed, Failed, Skipped, Timeout, Error])
    }

    proptest! {
        #[test]
        fn counts_and_success_follow_statuses(
            statuses in prop::collection::vec(any_status(), 0..16)
        ) {
            use StepStatus::*;
            let result = result_with(&statuses);
            let tally = |wanted: &[StepStatus]| {
                statuses.iter().filter(|status| wanted.contains(*status)).count()
            };

            prop_assert_eq!(result.total_count(), statuses.len());
            prop_assert_eq!(result.passed_count(), tally(&[Passed]));
            prop_assert_eq!(result.failed_count(), tally(&[Failed]));
            prop_assert_eq!(result.skipped_count(), tally(&[Skipped]));
            prop_assert_eq!(result.error_count(), tally(&[Error, Timeout]));
            prop_assert_eq!(
                result.is_success(),
                statuses
                    .iter()
                    .all(|status| !matches!(status, Failed | Error | Timeout))
            );
        }
    }

    #[test]
    fn mixed_statuses_are_counted_once_each() {
        use StepStatus::*;
        let result = result_with(&[Passed, Failed, Skipped, Timeout, Error]);
        assert_eq!(result.passed_count(), 1);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.skipped_count(), 1);
        assert_eq!(result.error_count(), 2);
        assert!(!result.is_success());
    }

    #[test]
    fn skipped_steps_do_not_break_success() {
        let result = result_with(&[StepStatus::Passed, StepStatus::Skipped]);
        assert!(result.is_success());
    }

    #[test]
    fn duration_is_zero_until_ended() {
        let step = Step::new("s", VmRef::new("vm.vmx"), "clean", Execution::program("a.exe"));
        let mut result = StepResult::pending(&step, "vm");
        assert_eq!(result.duration(), Duration::zero());
        let start = Utc::now();
        result.started_at = Some(start);
        assert_eq!(result.duration(), Duration::zero());
        result.ended_at = Some(start + Duration::seconds(5));
        assert_eq!(result.duration(), Duration::seconds(5));
    }

    #[test]
    fn format_duration_pads_fields() {
        assert_eq!(format_duration(Duration::seconds(3725)), "01:02:05");
        assert_eq!(format_duration(Duration::seconds(-4)), "00:00:00");
        assert_eq!(format_duration(Duration::hours(26)), "26:00:00");
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Timeout".parse::<StepStatus>(), Ok(StepStatus::Timeout));
        assert!("done".parse::<StepStatus>().is_err());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }
}
