//! `{Token}` substitution for result paths and hook macros.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

pub const RESULT_DIR_TOKEN: &str = "ResultDir";
pub const VM_NAME_TOKEN: &str = "VMName";
pub const STEP_NAME_TOKEN: &str = "StepName";
pub const TIMESTAMP_TOKEN: &str = "Timestamp";

/// Replace every `{name}` with its value. Unknown tokens stay verbatim.
pub fn expand_tokens<K, V>(template: &str, values: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out = template.to_string();
    for (name, value) in values {
        let token = format!("{{{}}}", name.as_ref());
        if out.contains(&token) {
            out = out.replace(&token, value.as_ref());
        }
    }
    out
}

/// `<root>/<yyyyMMdd>`
pub fn dated_result_dir(root: &Path, at: DateTime<Local>) -> PathBuf {
    root.join(at.format("%Y%m%d").to_string())
}

/// `yyyyMMdd_HHmmss`
pub fn timestamp_token(at: DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Values for the placeholders allowed in a result file's destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPathContext {
    pub result_dir: PathBuf,
    pub vm_name: String,
    pub step_name: String,
    pub captured_at: DateTime<Local>,
}

impl ResultPathContext {
    pub fn expand(&self, template: &str) -> String {
        let result_dir = self.result_dir.display().to_string();
        let timestamp = timestamp_token(self.captured_at);
        expand_tokens(
            template,
            &[
                (RESULT_DIR_TOKEN, result_dir.as_str()),
                (VM_NAME_TOKEN, self.vm_name.as_str()),
                (STEP_NAME_TOKEN, self.step_name.as_str()),
                (TIMESTAMP_TOKEN, timestamp.as_str()),
            ],
        )
    }
}
