//! Validation for settings and scenario documents.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{NotificationSinkKind, Settings};
use crate::scenario::{ConditionKind, Scenario, ScenarioEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

impl ValidationIssue {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Error,
            code,
            message: message.into(),
        }
    }

    fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Warning,
            code,
            message: message.into(),
        }
    }
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl Validate for Settings {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.boot_timeout_secs == 0 {
            issues.push(ValidationIssue::error(
                "settings.boot_timeout.zero",
                "boot_timeout_secs must be greater than zero",
            ));
        }

        if self.default_guest_username.trim().is_empty() {
            issues.push(ValidationIssue::warning(
                "settings.default_guest_username.empty",
                "default_guest_username is empty; guest login will use an empty user",
            ));
        }

        let mut seen_names = HashSet::new();
        for vm in &self.registered_vms {
            if vm.name.trim().is_empty() {
                issues.push(ValidationIssue::error(
                    "settings.vm.name.empty",
                    format!("registered vm {} has no name", vm.vmx_path),
                ));
            } else if !seen_names.insert(vm.name.to_lowercase()) {
                issues.push(ValidationIssue::warning(
                    "settings.vm.name.duplicate",
                    format!("vm name {:?} is registered more than once", vm.name),
                ));
            }
            if vm.vmx_path.as_str().trim().is_empty() {
                issues.push(ValidationIssue::error(
                    "settings.vm.vmx_path.empty",
                    format!("registered vm {:?} has no vmx path", vm.name),
                ));
            }
        }

        let notification = &self.notification;
        if notification.enabled {
            match notification.sink {
                NotificationSinkKind::None => issues.push(ValidationIssue::warning(
                    "notification.sink.none",
                    "notifications are enabled but no sink is configured",
                )),
                NotificationSinkKind::Stdout => {}
                NotificationSinkKind::Webhook
                | NotificationSinkKind::Slack
                | NotificationSinkKind::Teams => match notification.target_url() {
                    None => issues.push(ValidationIssue::error(
                        "notification.url.missing",
                        format!("{} sink requires a webhook URL", notification.sink),
                    )),
                    Some(url) if !is_http_url(url) => {
                        issues.push(ValidationIssue::warning(
                            "notification.url.invalid",
                            "webhook URL should start with http:// or https://",
                        ))
                    }
                    Some(_) => {}
                },
            }
        }

        issues
    }
}

fn validate_hook(label: &str, event: &ScenarioEvent, issues: &mut Vec<ValidationIssue>) {
    if !event.enabled {
        return;
    }
    if event.command.trim().is_empty() {
        issues.push(ValidationIssue::error(
            "scenario.hook.command.empty",
            format!("{label} hook is enabled but has no command"),
        ));
    }
    if event.timeout_secs == 0 {
        issues.push(ValidationIssue::error(
            "scenario.hook.timeout.zero",
            format!("{label} hook timeout must be greater than zero"),
        ));
    }
}

impl Validate for Scenario {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.name.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "scenario.name.empty",
                "scenario name must not be empty",
            ));
        }

        if self.max_parallel == 0 {
            issues.push(ValidationIssue::error(
                "scenario.max_parallel.zero",
                "max_parallel must be at least 1",
            ));
        }

        if self.steps.is_empty() {
            issues.push(ValidationIssue::warning(
                "scenario.steps.empty",
                "scenario has no steps",
            ));
        }

        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if !seen_ids.insert(&step.id) {
                issues.push(ValidationIssue::error(
                    "step.id.duplicate",
                    format!("step id {} is used more than once", step.id),
                ));
            }
        }

        for step in &self.steps {
            let label = if step.name.trim().is_empty() {
                issues.push(ValidationIssue::error(
                    "step.name.empty",
                    format!("step {} has no name", step.id),
                ));
                step.id.to_string()
            } else {
                step.name.clone()
            };

            if step.vm.as_str().trim().is_empty() {
                issues.push(ValidationIssue::error(
                    "step.vm.empty",
                    format!("step {label:?} has no target vm"),
                ));
            }
            if step.snapshot_name.trim().is_empty() {
                issues.push(ValidationIssue::error(
                    "step.snapshot.empty",
                    format!("step {label:?} has no snapshot to revert to"),
                ));
            }
            if step.execution.path.trim().is_empty() {
                issues.push(ValidationIssue::error(
                    "step.execution.path.empty",
                    format!("step {label:?} has nothing to execute"),
                ));
            }
            if step.execution.timeout_secs == 0 {
                issues.push(ValidationIssue::warning(
                    "step.execution.timeout.zero",
                    format!("step {label:?} has a zero execution timeout"),
                ));
            }
            if step.capture_screenshots && step.screenshot_interval_secs == 0 {
                issues.push(ValidationIssue::warning(
                    "step.screenshot_interval.zero",
                    format!("step {label:?} captures only a final screenshot"),
                ));
            }

            let Some(condition) = &step.condition else {
                continue;
            };
            if condition.kind == ConditionKind::SpecificStepResult {
                match &condition.reference_step_id {
                    None => issues.push(ValidationIssue::error(
                        "step.condition.reference.missing",
                        format!("step {label:?} condition needs a reference step"),
                    )),
                    Some(reference) if self.find_step(reference).is_none() => {
                        issues.push(ValidationIssue::error(
                            "step.condition.reference.unknown",
                            format!("step {label:?} condition references unknown step {reference}"),
                        ))
                    }
                    Some(_) => {}
                }
            }
            if !condition.is_always() && self.is_parallel() {
                issues.push(ValidationIssue::warning(
                    "step.condition.parallel",
                    format!("step {label:?} condition is not evaluated in parallel runs"),
                ));
            }
        }

        if let Some(event) = &self.pre_event {
            validate_hook("pre", event, &mut issues);
        }
        if let Some(event) = &self.post_event {
            validate_hook("post", event, &mut issues);
        }

        issues
    }
}
