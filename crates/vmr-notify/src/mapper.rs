//! Build notification messages from run documents.

use chrono::Utc;
use vmr_core::result::{format_duration, ScenarioResult, StepResult};
use vmr_core::scenario::Scenario;

use crate::types::{NotificationMessage, NotificationSeverity, NotificationTopic};

pub fn scenario_started_message(scenario: &Scenario) -> NotificationMessage {
    let mode = if scenario.is_parallel() {
        format!("parallel (max {})", scenario.max_parallel)
    } else {
        "sequential".to_string()
    };
    NotificationMessage {
        at: Utc::now(),
        topic: NotificationTopic::ScenarioStarted,
        severity: NotificationSeverity::Info,
        title: format!("Scenario started: {}", scenario.name),
        body: format!("{} step(s), {mode}", scenario.steps.len()),
        scenario_id: Some(scenario.id.clone()),
        vm_name: None,
    }
}

pub fn scenario_completed_message(result: &ScenarioResult) -> NotificationMessage {
    let (topic, severity, verdict) = if result.is_success() {
        (
            NotificationTopic::ScenarioPassed,
            NotificationSeverity::Info,
            "passed",
        )
    } else {
        (
            NotificationTopic::ScenarioFailed,
            NotificationSeverity::Error,
            "failed",
        )
    };
    let mut body = format!(
        "total {}, passed {}, failed {}, errors {}, skipped {}, duration {}",
        result.total_count(),
        result.passed_count(),
        result.failed_count(),
        result.error_count(),
        result.skipped_count(),
        format_duration(result.duration()),
    );
    if let Some(fault) = &result.fault {
        body.push_str(&format!("\n{fault}"));
    }
    NotificationMessage {
        at: Utc::now(),
        topic,
        severity,
        title: format!("Scenario {verdict}: {}", result.scenario_name),
        body,
        scenario_id: Some(result.scenario_id.clone()),
        vm_name: None,
    }
}

pub fn step_failed_message(result: &StepResult) -> NotificationMessage {
    let mut body = format!("status {}", result.status);
    if let Some(code) = result.exit_code {
        body.push_str(&format!(", exit code {code}"));
    }
    if let Some(error) = &result.error_message {
        body.push_str(&format!("\n{error}"));
    }
    NotificationMessage {
        at: Utc::now(),
        topic: NotificationTopic::StepFailed,
        severity: NotificationSeverity::Error,
        title: format!("Step failed: {}", result.step_name),
        body,
        scenario_id: None,
        vm_name: Some(result.vm_name.clone()),
    }
}

pub fn run_error_message(message: &str) -> NotificationMessage {
    NotificationMessage {
        at: Utc::now(),
        topic: NotificationTopic::RunError,
        severity: NotificationSeverity::Error,
        title: "Scenario run error".to_string(),
        body: message.to_string(),
        scenario_id: None,
        vm_name: None,
    }
}
