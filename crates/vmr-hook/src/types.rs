use serde::{Deserialize, Serialize};
use vmr_core::result::HookReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStream {
    Stdout,
    Stderr,
}

impl HookStream {
    pub fn as_str(self) -> &'static str {
        match self {
            HookStream::Stdout => "stdout",
            HookStream::Stderr => "stderr",
        }
    }
}

/// What a single hook invocation produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HookOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl HookOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn report(&self) -> HookReport {
        HookReport {
            success: self.success,
            exit_code: self.exit_code,
            timed_out: self.timed_out,
            error_message: self.error_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_carries_failure_details() {
        let mut outcome = HookOutcome::failed("Exit Code: 4");
        outcome.exit_code = Some(4);

        let report = outcome.report();
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(4));
        assert_eq!(report.error_message.as_deref(), Some("Exit Code: 4"));
        assert!(!report.timed_out);
    }

    #[test]
    fn disabled_hook_counts_as_success() {
        let outcome = HookOutcome::disabled();
        assert!(outcome.success);
        assert!(outcome.error_message.is_none());
    }
}
