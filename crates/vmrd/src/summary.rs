//! Run outcome rendering and process exit codes for the CLI.

use vmr_core::result::{format_duration, ScenarioResult};
use vmr_core::scenario::Scenario;

/// Process exit codes of `vmregress run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    AllPassed,
    SomeFailed,
    ScenarioNotFound,
    VmConnectFailed,
    InvalidInput,
    TimedOutOrInternal,
}

impl RunExit {
    pub fn code(self) -> i32 {
        match self {
            RunExit::AllPassed => 0,
            RunExit::SomeFailed => 1,
            RunExit::ScenarioNotFound => 2,
            RunExit::VmConnectFailed => 3,
            RunExit::InvalidInput => 4,
            RunExit::TimedOutOrInternal => 5,
        }
    }

    /// Exit code for a finished run. A cancelled run counts as timed out.
    pub fn for_result(result: &ScenarioResult) -> Self {
        if result.cancelled {
            RunExit::TimedOutOrInternal
        } else if result.is_success() && result.fault.is_none() {
            RunExit::AllPassed
        } else {
            RunExit::SomeFailed
        }
    }
}

/// Keeps only the steps targeting `vm_name`, matched against the registered
/// name or the vmx path's file stem. Returns how many steps remain.
pub fn retain_steps_for_vm(
    scenario: &mut Scenario,
    vm_name: &str,
    resolve_name: impl Fn(&vmr_core::types::VmRef) -> String,
) -> usize {
    scenario.steps.retain(|step| {
        resolve_name(&step.vm).eq_ignore_ascii_case(vm_name)
            || step.vm.fallback_name().eq_ignore_ascii_case(vm_name)
    });
    scenario.steps.len()
}

pub fn render_text(result: &ScenarioResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("Scenario: {}\n", result.scenario_name));
    out.push_str(&format!("Duration: {}\n", format_duration(result.duration())));
    out.push_str(&format!(
        "Steps: {} total, {} passed, {} failed, {} skipped, {} errors\n",
        result.total_count(),
        result.passed_count(),
        result.failed_count(),
        result.skipped_count(),
        result.error_count()
    ));
    for step in &result.step_results {
        out.push_str(&format!(
            "  [{:>7}] {} ({}) {}",
            step.status.as_str().to_uppercase(),
            step.step_name,
            step.vm_name,
            format_duration(step.duration())
        ));
        if let Some(message) = step.error_message.as_deref().filter(|m| !m.is_empty()) {
            out.push_str(&format!(" - {message}"));
        }
        out.push('\n');
    }
    if let Some(fault) = &result.fault {
        out.push_str(&format!("Fault: {fault}\n"));
    }
    if result.cancelled {
        out.push_str("Run was cancelled before all steps started\n");
    }
    out.push_str(if result.is_success() && result.fault.is_none() {
        "Result: PASSED\n"
    } else {
        "Result: FAILED\n"
    });
    out
}
