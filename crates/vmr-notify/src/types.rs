use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmr_core::types::ScenarioId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSeverity {
    Info,
    Warning,
    Error,
}

impl NotificationSeverity {
    pub fn label(self) -> &'static str {
        match self {
            NotificationSeverity::Info => "INFO",
            NotificationSeverity::Warning => "WARN",
            NotificationSeverity::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTopic {
    ScenarioStarted,
    ScenarioPassed,
    ScenarioFailed,
    StepFailed,
    RunError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub at: DateTime<Utc>,
    pub topic: NotificationTopic,
    pub severity: NotificationSeverity,
    pub title: String,
    pub body: String,
    pub scenario_id: Option<ScenarioId>,
    pub vm_name: Option<String>,
}
