//! Step conditions, judged against the results recorded so far in a
//! sequential run.

use vmr_core::result::{StepResult, StepStatus};
use vmr_core::scenario::{ConditionKind, StepCondition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionVerdict {
    Run,
    Skip { reason: String },
}

impl ConditionVerdict {
    pub fn should_run(&self) -> bool {
        matches!(self, ConditionVerdict::Run)
    }

    fn skip(reason: impl Into<String>) -> Self {
        ConditionVerdict::Skip {
            reason: reason.into(),
        }
    }
}

/// Failed, errored and timed-out steps all count as failures here.
fn is_failure(status: StepStatus) -> bool {
    status == StepStatus::Failed || status.is_error_like()
}

pub fn evaluate_condition(
    condition: Option<&StepCondition>,
    previous: &[StepResult],
) -> ConditionVerdict {
    let Some(condition) = condition else {
        return ConditionVerdict::Run;
    };
    let last = previous
        .iter()
        .rev()
        .find(|result| result.status != StepStatus::Skipped);

    match condition.kind {
        ConditionKind::Always => ConditionVerdict::Run,
        ConditionKind::PreviousPassed => match last {
            Some(result) if result.status == StepStatus::Passed => ConditionVerdict::Run,
            Some(result) => ConditionVerdict::skip(format!(
                "condition previous_passed not met: '{}' was {}",
                result.step_name, result.status
            )),
            None => ConditionVerdict::skip("condition previous_passed not met: no previous step ran"),
        },
        ConditionKind::PreviousFailed => match last {
            Some(result) if is_failure(result.status) => ConditionVerdict::Run,
            Some(result) => ConditionVerdict::skip(format!(
                "condition previous_failed not met: '{}' was {}",
                result.step_name, result.status
            )),
            None => ConditionVerdict::skip("condition previous_failed not met: no previous step ran"),
        },
        ConditionKind::AllPreviousPassed => {
            match previous
                .iter()
                .find(|result| result.status != StepStatus::Passed && result.status != StepStatus::Skipped)
            {
                None => ConditionVerdict::Run,
                Some(result) => ConditionVerdict::skip(format!(
                    "condition all_previous_passed not met: '{}' was {}",
                    result.step_name, result.status
                )),
            }
        }
        ConditionKind::AnyPreviousFailed => {
            if previous.iter().any(|result| is_failure(result.status)) {
                ConditionVerdict::Run
            } else {
                ConditionVerdict::skip("condition any_previous_failed not met: no previous step failed")
            }
        }
        ConditionKind::SpecificStepResult => {
            let Some(reference) = &condition.reference_step_id else {
                return ConditionVerdict::skip(
                    "condition specific_step_result has no reference step",
                );
            };
            match previous.iter().find(|result| &result.step_id == reference) {
                Some(result) if result.status == condition.expected_result => ConditionVerdict::Run,
                Some(result) => ConditionVerdict::skip(format!(
                    "condition specific_step_result not met: '{}' was {}, expected {}",
                    result.step_name, result.status, condition.expected_result
                )),
                None => ConditionVerdict::skip(format!(
                    "condition specific_step_result not met: step {reference} has no result"
                )),
            }
        }
    }
}
