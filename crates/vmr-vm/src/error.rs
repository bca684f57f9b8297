use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("vmrun command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("vmrun command returned non-zero exit ({command}) status={status:?}: {}", failure_text(.stdout, .stderr))]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("vmrun command timed out after {timeout_secs}s ({command})")]
    Timeout { command: String, timeout_secs: u64 },
    #[error("vmrun binary not found; searched: {}", render_paths(.searched))]
    BinaryNotFound { searched: Vec<PathBuf> },
    #[error("vm control is not connected")]
    NotConnected,
    #[error("no guest login for {vm}")]
    NotLoggedIn { vm: String },
    #[error("invalid vmrun invocation: {message}")]
    InvalidInvocation { message: String },
    #[error("failed to create host directory {path}: {source}")]
    HostIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{operation} failed for {vm}: {message}")]
    OperationFailed {
        operation: &'static str,
        vm: String,
        message: String,
    },
    #[error("unable to parse vmrun output: {message}")]
    Parse { message: String },
}

impl VmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, VmError::Timeout { .. })
    }

    /// Short text suitable for a step's error message.
    pub fn failure_message(&self) -> String {
        match self {
            VmError::CommandFailed { stdout, stderr, .. } => {
                let text = failure_text(stdout, stderr);
                if text.is_empty() {
                    self.to_string()
                } else {
                    text
                }
            }
            other => other.to_string(),
        }
    }
}

/// vmrun reports most failures on stdout as `Error: ...`.
pub fn failure_text(stdout: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    stdout.trim().to_string()
}

fn render_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "(none)".to_string();
    }
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
