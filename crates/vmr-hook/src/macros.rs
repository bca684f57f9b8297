//! Macro values and environment for pre/post hooks.

use chrono::{DateTime, Duration, Local};
use std::path::{Path, PathBuf};

use vmr_core::placeholder::{dated_result_dir, expand_tokens};
use vmr_core::result::{format_duration, ScenarioResult};

/// Counts taken from a finished run, available to post-hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    pub duration: Duration,
}

impl RunSummary {
    pub fn of(result: &ScenarioResult) -> Self {
        Self {
            passed: result.passed_count(),
            failed: result.failed_count(),
            total: result.total_count(),
            duration: result.duration(),
        }
    }

    /// Hook-facing success flag. Only failed steps count.
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookMacroContext {
    pub scenario_name: String,
    pub now: DateTime<Local>,
    pub result_root: PathBuf,
    pub summary: Option<RunSummary>,
}

impl HookMacroContext {
    pub fn new(
        scenario_name: impl Into<String>,
        result_root: impl AsRef<Path>,
        result: Option<&ScenarioResult>,
    ) -> Self {
        Self {
            scenario_name: scenario_name.into(),
            now: Local::now(),
            result_root: result_root.as_ref().to_path_buf(),
            summary: result.map(RunSummary::of),
        }
    }

    pub fn at(mut self, now: DateTime<Local>) -> Self {
        self.now = now;
        self
    }

    pub fn macro_values(&self) -> Vec<(&'static str, String)> {
        let mut values = vec![
            ("ScenarioName", self.scenario_name.clone()),
            ("Date", self.now.format("%Y-%m-%d").to_string()),
            ("Time", self.now.format("%H-%M-%S").to_string()),
            ("DateTime", self.now.format("%Y%m%d_%H%M%S").to_string()),
            (
                "ResultDir",
                dated_result_dir(&self.result_root, self.now)
                    .display()
                    .to_string(),
            ),
        ];
        if let Some(summary) = &self.summary {
            values.push(("PassedCount", summary.passed.to_string()));
            values.push(("FailedCount", summary.failed.to_string()));
            values.push(("TotalCount", summary.total.to_string()));
            values.push(("Duration", format_duration(summary.duration)));
            values.push(("Success", summary.success().to_string()));
        }
        values
    }

    pub fn expand(&self, input: &str) -> String {
        expand_tokens(input, &self.macro_values())
    }

    /// Variables every hook process receives on top of the user-declared ones.
    pub fn fixed_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("SCENARIO_NAME".to_string(), self.scenario_name.clone()),
            ("TEST_DATE".to_string(), self.now.format("%Y-%m-%d").to_string()),
            ("TEST_TIME".to_string(), self.now.format("%H:%M:%S").to_string()),
        ];
        if let Some(summary) = &self.summary {
            env.push(("TEST_PASSED".to_string(), summary.passed.to_string()));
            env.push(("TEST_FAILED".to_string(), summary.failed.to_string()));
            env.push(("TEST_TOTAL".to_string(), summary.total.to_string()));
            env.push(("TEST_SUCCESS".to_string(), summary.success().to_string()));
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vmr_core::result::{StepResult, StepStatus};
    use vmr_core::scenario::{Execution, Scenario, Step};
    use vmr_core::types::VmRef;

    fn fixed_now() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 5, 6, 7, 8, 9)
            .single()
            .expect("valid local timestamp")
    }

    fn result_with_three_passed() -> ScenarioResult {
        let scenario = Scenario::new("Regression");
        let mut result = ScenarioResult::start(&scenario);
        for index in 0..3 {
            let step = Step::new(
                format!("s{index}"),
                VmRef::new("vm.vmx"),
                "clean",
                Execution::program("a.exe"),
            );
            let mut step_result = StepResult::pending(&step, "vm");
            step_result.status = StepStatus::Passed;
            result.step_results.push(step_result);
        }
        result.ended_at = Some(result.started_at + Duration::seconds(65));
        result
    }

    #[test]
    fn expands_scenario_and_result_macros() {
        let result = result_with_three_passed();
        let context = HookMacroContext::new("Regression", "results", Some(&result)).at(fixed_now());

        let expanded = context.expand("notify.exe {ScenarioName} {PassedCount}/{TotalCount} {Success} {Duration}");
        assert!(expanded.contains("Regression"));
        assert!(expanded.contains("3/3"));
        assert!(expanded.contains("true"));
        assert!(expanded.contains("00:01:05"));
    }

    #[test]
    fn pre_hook_context_leaves_result_macros_untouched() {
        let context = HookMacroContext::new("Nightly", "results", None).at(fixed_now());
        let expanded = context.expand("{Date}_{Time}_{DateTime} {PassedCount}");
        assert_eq!(expanded, "2026-05-06_07-08-09_20260506_070809 {PassedCount}");
        assert_eq!(
            context.expand("{ResultDir}"),
            Path::new("results").join("20260506").display().to_string()
        );
    }

    #[test]
    fn fixed_env_includes_counts_only_with_result() {
        let context = HookMacroContext::new("Nightly", "results", None).at(fixed_now());
        let env = context.fixed_env();
        assert_eq!(env.len(), 3);
        assert!(env.contains(&("TEST_TIME".to_string(), "07:08:09".to_string())));

        let result = result_with_three_passed();
        let context = HookMacroContext::new("Nightly", "results", Some(&result)).at(fixed_now());
        let env = context.fixed_env();
        assert!(env.contains(&("TEST_PASSED".to_string(), "3".to_string())));
        assert!(env.contains(&("TEST_SUCCESS".to_string(), "true".to_string())));
    }
}
