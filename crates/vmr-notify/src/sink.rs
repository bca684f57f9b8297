use std::process::Command;
use std::sync::Arc;

use vmr_core::config::{NotificationSettings, NotificationSinkKind};

use crate::error::NotifyError;
use crate::types::{NotificationMessage, NotificationSeverity};

pub const DEFAULT_SINK_TIMEOUT_SECS: u64 = 10;

pub trait NotificationSink: Send + Sync {
    fn kind(&self) -> NotificationSinkKind;
    fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Default)]
pub struct StdoutSink;

impl NotificationSink for StdoutSink {
    fn kind(&self) -> NotificationSinkKind {
        NotificationSinkKind::Stdout
    }

    fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        println!(
            "[{}] {} | {}",
            message.severity.label(),
            message.title,
            message.body.replace('\n', " / ")
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSink {
    pub url: String,
    pub timeout_secs: u64,
}

impl WebhookSink {
    pub fn build_payload(message: &NotificationMessage) -> serde_json::Value {
        serde_json::json!({
            "topic": message.topic,
            "severity": message.severity,
            "title": &message.title,
            "body": &message.body,
            "scenario_id": message
                .scenario_id
                .as_ref()
                .map(|id| id.0.clone())
                .unwrap_or_default(),
            "vm_name": message.vm_name.clone().unwrap_or_default(),
            "at": message.at.to_rfc3339(),
        })
    }
}

impl NotificationSink for WebhookSink {
    fn kind(&self) -> NotificationSinkKind {
        NotificationSinkKind::Webhook
    }

    fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        post_json(&self.url, &Self::build_payload(message), self.timeout_secs, "webhook")
    }
}

/// Slack incoming webhook with a single mrkdwn section block.
#[derive(Debug, Clone)]
pub struct SlackSink {
    pub webhook_url: String,
    pub timeout_secs: u64,
}

impl SlackSink {
    pub fn build_payload(message: &NotificationMessage) -> serde_json::Value {
        let vm_label = message
            .vm_name
            .as_ref()
            .map(|vm| format!(" | vm: `{vm}`"))
            .unwrap_or_default();
        let text = format!(
            "[{}] *{}*{}\n{}",
            message.severity.label(),
            message.title,
            vm_label,
            message.body
        );

        serde_json::json!({
            "text": text,
            "blocks": [
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": text
                    }
                }
            ]
        })
    }
}

impl NotificationSink for SlackSink {
    fn kind(&self) -> NotificationSinkKind {
        NotificationSinkKind::Slack
    }

    fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        post_json(
            &self.webhook_url,
            &Self::build_payload(message),
            self.timeout_secs,
            "Slack",
        )
    }
}

/// Teams incoming webhook using the legacy MessageCard schema.
#[derive(Debug, Clone)]
pub struct TeamsSink {
    pub webhook_url: String,
    pub timeout_secs: u64,
}

impl TeamsSink {
    pub fn build_payload(message: &NotificationMessage) -> serde_json::Value {
        let theme_color = match message.severity {
            NotificationSeverity::Info => "2DC72D",
            NotificationSeverity::Warning => "FFA500",
            NotificationSeverity::Error => "D70000",
        };
        serde_json::json!({
            "@type": "MessageCard",
            "@context": "https://schema.org/extensions",
            "themeColor": theme_color,
            "summary": &message.title,
            "title": &message.title,
            "text": message.body.replace('\n', "<br>"),
        })
    }
}

impl NotificationSink for TeamsSink {
    fn kind(&self) -> NotificationSinkKind {
        NotificationSinkKind::Teams
    }

    fn send(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        post_json(
            &self.webhook_url,
            &Self::build_payload(message),
            self.timeout_secs,
            "Teams",
        )
    }
}

/// Sink for the configured kind. `None` means notifications go nowhere.
pub fn sink_from_settings(
    settings: &NotificationSettings,
) -> Result<Option<Arc<dyn NotificationSink>>, NotifyError> {
    let url = || {
        settings
            .target_url()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .ok_or_else(|| NotifyError::SinkNotConfigured {
                sink: settings.sink.to_string(),
            })
    };
    let sink: Arc<dyn NotificationSink> = match settings.sink {
        NotificationSinkKind::None => return Ok(None),
        NotificationSinkKind::Stdout => Arc::new(StdoutSink),
        NotificationSinkKind::Webhook => Arc::new(WebhookSink {
            url: url()?,
            timeout_secs: DEFAULT_SINK_TIMEOUT_SECS,
        }),
        NotificationSinkKind::Slack => Arc::new(SlackSink {
            webhook_url: url()?,
            timeout_secs: DEFAULT_SINK_TIMEOUT_SECS,
        }),
        NotificationSinkKind::Teams => Arc::new(TeamsSink {
            webhook_url: url()?,
            timeout_secs: DEFAULT_SINK_TIMEOUT_SECS,
        }),
    };
    Ok(Some(sink))
}

fn post_json(
    url: &str,
    payload: &serde_json::Value,
    timeout_secs: u64,
    label: &str,
) -> Result<(), NotifyError> {
    let body = serde_json::to_string(payload).map_err(|e| NotifyError::SinkFailed {
        message: format!("failed to encode {label} payload: {e}"),
    })?;

    let output = Command::new("curl")
        .arg("-sS")
        .arg("-f")
        .arg("-m")
        .arg(timeout_secs.to_string())
        .arg("-X")
        .arg("POST")
        .arg("-H")
        .arg("Content-Type: application/json")
        .arg("-d")
        .arg(body)
        .arg(url)
        .output()
        .map_err(|e| NotifyError::SinkFailed {
            message: format!("failed to execute curl for {label} sink: {e}"),
        })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(NotifyError::SinkFailed {
        message: format!(
            "{label} request failed (status {:?}): {}",
            output.status.code(),
            stderr.trim()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NotificationTopic;
    use chrono::Utc;
    use vmr_core::types::ScenarioId;

    fn mk_message() -> NotificationMessage {
        NotificationMessage {
            at: Utc::now(),
            topic: NotificationTopic::StepFailed,
            severity: NotificationSeverity::Error,
            title: "Step failed: install".to_string(),
            body: "status failed\nExit Code: 2".to_string(),
            scenario_id: Some(ScenarioId::new("scn-1")),
            vm_name: Some("win10".to_string()),
        }
    }

    #[test]
    fn slack_payload_includes_severity_title_and_vm() {
        let payload = SlackSink::build_payload(&mk_message());
        let text = payload["text"].as_str().expect("text field");
        assert!(text.starts_with("[ERROR] *Step failed: install*"));
        assert!(text.contains("vm: `win10`"));
        assert_eq!(payload["blocks"][0]["text"]["type"], "mrkdwn");
    }

    #[test]
    fn teams_payload_is_message_card_with_severity_color() {
        let payload = TeamsSink::build_payload(&mk_message());
        assert_eq!(payload["@type"], "MessageCard");
        assert_eq!(payload["themeColor"], "D70000");
        assert_eq!(payload["text"], "status failed<br>Exit Code: 2");
    }

    #[test]
    fn webhook_payload_carries_ids() {
        let payload = WebhookSink::build_payload(&mk_message());
        assert_eq!(payload["topic"], "step_failed");
        assert_eq!(payload["scenario_id"], "scn-1");
        assert_eq!(payload["vm_name"], "win10");
    }

    #[test]
    fn sink_from_settings_requires_url_for_http_sinks() {
        let mut settings = NotificationSettings {
            sink: NotificationSinkKind::Slack,
            ..NotificationSettings::default()
        };
        let err = match sink_from_settings(&settings) {
            Ok(_) => panic!("slack without url should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, NotifyError::SinkNotConfigured { ref sink } if sink == "slack"));

        settings.slack_webhook_url = Some("https://hooks.slack.test/x".to_string());
        let sink = sink_from_settings(&settings)
            .expect("sink")
            .expect("configured sink");
        assert_eq!(sink.kind(), NotificationSinkKind::Slack);
    }

    #[test]
    fn sink_from_settings_none_and_stdout() {
        let settings = NotificationSettings::default();
        assert!(sink_from_settings(&settings).expect("none sink").is_none());

        let settings = NotificationSettings {
            sink: NotificationSinkKind::Stdout,
            ..NotificationSettings::default()
        };
        let sink = sink_from_settings(&settings)
            .expect("stdout sink")
            .expect("configured sink");
        assert!(sink.send(&mk_message()).is_ok());
    }
}
