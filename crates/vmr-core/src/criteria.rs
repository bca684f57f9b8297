//! Success criteria and the step outcome evaluator.

use serde::{Deserialize, Serialize};

/// All fields optional and AND-combined. An empty set always succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SuccessCriteria {
    #[serde(default)]
    pub expected_exit_code: Option<i32>,
    #[serde(default)]
    pub contains_text: Option<String>,
    #[serde(default)]
    pub not_contains_text: Option<String>,
}

impl SuccessCriteria {
    pub fn exit_code(code: i32) -> Self {
        Self {
            expected_exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn contains(text: impl Into<String>) -> Self {
        Self {
            contains_text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn not_contains(text: impl Into<String>) -> Self {
        Self {
            not_contains_text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.expected_exit_code.is_none()
            && self.contains_text.is_none()
            && self.not_contains_text.is_none()
    }
}

/// Judge an observed outcome. `None` criteria succeed unconditionally.
///
/// A missing exit code never equals an expected one, and missing output
/// fails a `contains_text` rule.
pub fn evaluate(
    criteria: Option<&SuccessCriteria>,
    exit_code: Option<i32>,
    output: Option<&str>,
) -> bool {
    let Some(criteria) = criteria else {
        return true;
    };

    if let Some(expected) = criteria.expected_exit_code {
        if exit_code != Some(expected) {
            return false;
        }
    }

    if let Some(needle) = criteria.contains_text.as_deref() {
        match output {
            Some(text) if !text.is_empty() && text.contains(needle) => {}
            _ => return false,
        }
    }

    if let Some(needle) = criteria.not_contains_text.as_deref() {
        if output.is_some_and(|text| text.contains(needle)) {
            return false;
        }
    }

    true
}
