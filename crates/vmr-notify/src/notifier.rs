//! The notification collaborator the orchestrator talks to.

use std::sync::Arc;

use async_trait::async_trait;
use vmr_core::config::NotificationSettings;
use vmr_core::result::{ScenarioResult, StepResult};
use vmr_core::scenario::Scenario;

use crate::error::NotifyError;
use crate::mapper::{
    run_error_message, scenario_completed_message, scenario_started_message, step_failed_message,
};
use crate::sink::{sink_from_settings, NotificationSink};
use crate::types::NotificationMessage;

/// Called unconditionally by the orchestrator. Implementations decide
/// whether to act and must not fail the run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn on_scenario_started(&self, scenario: &Scenario);
    async fn on_scenario_completed(&self, result: &ScenarioResult);
    async fn on_step_failed(&self, result: &StepResult);
    async fn on_error(&self, message: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn on_scenario_started(&self, _scenario: &Scenario) {}
    async fn on_scenario_completed(&self, _result: &ScenarioResult) {}
    async fn on_step_failed(&self, _result: &StepResult) {}
    async fn on_error(&self, _message: &str) {}
}

/// Sends messages to the configured sink, gated by the per-event flags.
pub struct NotificationDispatcher {
    settings: NotificationSettings,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl NotificationDispatcher {
    pub fn new(settings: NotificationSettings, sink: Option<Arc<dyn NotificationSink>>) -> Self {
        Self { settings, sink }
    }

    pub fn from_settings(settings: &NotificationSettings) -> Result<Self, NotifyError> {
        let sink = if settings.enabled {
            sink_from_settings(settings)?
        } else {
            None
        };
        Ok(Self::new(settings.clone(), sink))
    }

    pub fn is_active(&self) -> bool {
        self.settings.enabled && self.sink.is_some()
    }

    pub async fn dispatch(&self, message: NotificationMessage) -> Result<(), NotifyError> {
        let Some(sink) = self.sink.clone() else {
            return Ok(());
        };
        let kind = sink.kind();
        tokio::task::spawn_blocking(move || sink.send(&message))
            .await
            .map_err(|err| NotifyError::SinkFailed {
                message: format!("{kind} sink task failed: {err}"),
            })?
    }

    async fn deliver(&self, gate: bool, message: NotificationMessage) {
        if !self.settings.enabled || !gate {
            return;
        }
        let topic = message.topic;
        if let Err(err) = self.dispatch(message).await {
            tracing::warn!(?topic, error = %err, "notification delivery failed");
        }
    }
}

#[async_trait]
impl Notifier for NotificationDispatcher {
    async fn on_scenario_started(&self, scenario: &Scenario) {
        self.deliver(
            self.settings.notify_on_start,
            scenario_started_message(scenario),
        )
        .await;
    }

    async fn on_scenario_completed(&self, result: &ScenarioResult) {
        self.deliver(
            self.settings.notify_on_complete,
            scenario_completed_message(result),
        )
        .await;
    }

    async fn on_step_failed(&self, result: &StepResult) {
        self.deliver(self.settings.notify_on_failure, step_failed_message(result))
            .await;
    }

    async fn on_error(&self, message: &str) {
        self.deliver(self.settings.notify_on_error, run_error_message(message))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vmr_core::config::NotificationSinkKind;
    use vmr_core::result::StepStatus;
    use vmr_core::scenario::{Execution, Step};
    use vmr_core::types::VmRef;

    #[derive(Default)]
    struct CaptureSink {
        seen: Mutex<Vec<String>>,
    }

    impl NotificationSink for CaptureSink {
        fn kind(&self) -> NotificationSinkKind {
            NotificationSinkKind::Webhook
        }

        fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
            self.seen
                .lock()
                .expect("capture lock")
                .push(message.title.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl NotificationSink for FailingSink {
        fn kind(&self) -> NotificationSinkKind {
            NotificationSinkKind::Slack
        }

        fn send(&self, _message: &NotificationMessage) -> Result<(), NotifyError> {
            Err(NotifyError::SinkFailed {
                message: "offline".to_string(),
            })
        }
    }

    fn enabled_settings() -> NotificationSettings {
        NotificationSettings {
            enabled: true,
            sink: NotificationSinkKind::Webhook,
            ..NotificationSettings::default()
        }
    }

    fn failed_step() -> StepResult {
        let step = Step::new("install", VmRef::new("a.vmx"), "clean", Execution::program("x"));
        let mut result = StepResult::pending(&step, "a");
        result.status = StepStatus::Failed;
        result
    }

    #[tokio::test]
    async fn flags_gate_each_callback() {
        let sink = Arc::new(CaptureSink::default());
        let dispatcher = NotificationDispatcher::new(enabled_settings(), Some(sink.clone()));

        let scenario = Scenario::new("Nightly");
        dispatcher.on_scenario_started(&scenario).await;
        dispatcher.on_step_failed(&failed_step()).await;
        dispatcher.on_error("vmrun missing").await;

        let seen = sink.seen.lock().expect("capture lock");
        assert_eq!(
            seen.as_slice(),
            ["Step failed: install", "Scenario run error"]
        );
    }

    #[tokio::test]
    async fn disabled_settings_send_nothing() {
        let sink = Arc::new(CaptureSink::default());
        let settings = NotificationSettings {
            enabled: false,
            ..enabled_settings()
        };
        let dispatcher = NotificationDispatcher::new(settings, Some(sink.clone()));

        dispatcher.on_error("boom").await;
        assert!(sink.seen.lock().expect("capture lock").is_empty());
        assert!(!dispatcher.is_active());
    }

    #[tokio::test]
    async fn sink_failures_are_swallowed_by_callbacks() {
        let dispatcher = NotificationDispatcher::new(enabled_settings(), Some(Arc::new(FailingSink)));
        dispatcher.on_error("boom").await;

        let err = dispatcher
            .dispatch(run_error_message("boom"))
            .await
            .expect_err("failing sink");
        assert!(err.to_string().contains("offline"));
    }

    #[test]
    fn from_settings_skips_sink_when_disabled() {
        let settings = NotificationSettings {
            enabled: false,
            sink: NotificationSinkKind::Teams,
            ..NotificationSettings::default()
        };
        let dispatcher = NotificationDispatcher::from_settings(&settings).expect("dispatcher");
        assert!(!dispatcher.is_active());
    }
}
