use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::VmError;

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;
pub const SNAPSHOT_COMMAND_TIMEOUT_SECS: u64 = 120;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// The vmrun subcommands this crate drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmrunCommand {
    Start,
    CheckToolsState,
    RevertToSnapshot,
    ListSnapshots,
    List,
    CopyFileFromHostToGuest,
    CopyFileFromGuestToHost,
    CreateDirectoryInGuest,
    RunProgramInGuest,
    RunScriptInGuest,
    CaptureScreen,
    DisconnectNamedDevice,
}

impl VmrunCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            VmrunCommand::Start => "start",
            VmrunCommand::CheckToolsState => "checkToolsState",
            VmrunCommand::RevertToSnapshot => "revertToSnapshot",
            VmrunCommand::ListSnapshots => "listSnapshots",
            VmrunCommand::List => "list",
            VmrunCommand::CopyFileFromHostToGuest => "copyFileFromHostToGuest",
            VmrunCommand::CopyFileFromGuestToHost => "copyFileFromGuestToHost",
            VmrunCommand::CreateDirectoryInGuest => "createDirectoryInGuest",
            VmrunCommand::RunProgramInGuest => "runProgramInGuest",
            VmrunCommand::RunScriptInGuest => "runScriptInGuest",
            VmrunCommand::CaptureScreen => "captureScreen",
            VmrunCommand::DisconnectNamedDevice => "disconnectNamedDevice",
        }
    }

    pub fn default_timeout_secs(self) -> u64 {
        match self {
            VmrunCommand::RevertToSnapshot | VmrunCommand::ListSnapshots => {
                SNAPSHOT_COMMAND_TIMEOUT_SECS
            }
            _ => DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }

    /// Guest operations need `-gu/-gp` credentials.
    pub fn requires_guest_login(self) -> bool {
        matches!(
            self,
            VmrunCommand::CopyFileFromHostToGuest
                | VmrunCommand::CopyFileFromGuestToHost
                | VmrunCommand::CreateDirectoryInGuest
                | VmrunCommand::RunProgramInGuest
                | VmrunCommand::RunScriptInGuest
        )
    }

    /// Minimum positional arguments after the subcommand.
    fn min_args(self) -> usize {
        match self {
            VmrunCommand::List => 0,
            VmrunCommand::Start
            | VmrunCommand::CheckToolsState
            | VmrunCommand::ListSnapshots => 1,
            VmrunCommand::RevertToSnapshot
            | VmrunCommand::CreateDirectoryInGuest
            | VmrunCommand::RunProgramInGuest
            | VmrunCommand::CaptureScreen
            | VmrunCommand::DisconnectNamedDevice => 2,
            VmrunCommand::CopyFileFromHostToGuest
            | VmrunCommand::CopyFileFromGuestToHost
            | VmrunCommand::RunScriptInGuest => 3,
        }
    }
}

impl std::fmt::Display for VmrunCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmrunOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl VmrunOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmrunCli {
    pub binary: PathBuf,
}

impl Default for VmrunCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(vmrun_binary_name()),
        }
    }
}

impl VmrunCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run one vmrun subcommand. A non-zero exit is returned as output, not as an error.
    pub async fn run(
        &self,
        command: VmrunCommand,
        credentials: Option<&GuestCredentials>,
        args: &[String],
        timeout_secs: u64,
    ) -> Result<VmrunOutput, VmError> {
        let full_args = build_args(command, credentials, args)?;
        let rendered = render_command(&self.binary, &full_args);
        tracing::debug!(command = %rendered, timeout_secs, "running vmrun");

        let mut process = Command::new(&self.binary);
        process
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        process.creation_flags(CREATE_NO_WINDOW);

        let child = process.spawn().map_err(|source| VmError::Io {
            command: rendered.clone(),
            source,
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let waited =
            tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
                .await;
        let output = match waited {
            Ok(result) => result.map_err(|source| VmError::Io {
                command: rendered.clone(),
                source,
            })?,
            Err(_) => {
                tracing::warn!(command = %rendered, timeout_secs, "vmrun timed out; killed");
                return Err(VmError::Timeout {
                    command: rendered,
                    timeout_secs,
                });
            }
        };

        Ok(VmrunOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like [`VmrunCli::run`] but a non-zero exit becomes [`VmError::CommandFailed`].
    pub async fn run_checked(
        &self,
        command: VmrunCommand,
        credentials: Option<&GuestCredentials>,
        args: &[String],
        timeout_secs: u64,
    ) -> Result<VmrunOutput, VmError> {
        let output = self.run(command, credentials, args, timeout_secs).await?;
        if output.success() {
            return Ok(output);
        }
        let full_args = build_args(command, credentials, args)?;
        Err(VmError::CommandFailed {
            command: render_command(&self.binary, &full_args),
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

pub fn vmrun_binary_name() -> &'static str {
    if cfg!(windows) {
        "vmrun.exe"
    } else {
        "vmrun"
    }
}

fn build_args(
    command: VmrunCommand,
    credentials: Option<&GuestCredentials>,
    args: &[String],
) -> Result<Vec<String>, VmError> {
    validate_invocation(command, credentials, args)?;

    let mut full = Vec::with_capacity(args.len() + 5);
    if let Some(credentials) = credentials {
        full.push("-gu".to_string());
        full.push(credentials.username.clone());
        full.push("-gp".to_string());
        full.push(credentials.password.clone());
    }
    full.push(command.as_str().to_string());
    full.extend(args.iter().cloned());
    Ok(full)
}

fn validate_invocation(
    command: VmrunCommand,
    credentials: Option<&GuestCredentials>,
    args: &[String],
) -> Result<(), VmError> {
    if command.requires_guest_login() && credentials.is_none() {
        return Err(VmError::InvalidInvocation {
            message: format!("{command} requires guest credentials"),
        });
    }
    let required = command.min_args();
    if args.len() < required || args.iter().take(required).any(|arg| arg.trim().is_empty()) {
        return Err(VmError::InvalidInvocation {
            message: format!(
                "{command} expects {required} non-empty argument(s), got {:?}",
                args
            ),
        });
    }
    Ok(())
}

/// Render for logs. Guest passwords are masked.
fn render_command(binary: &Path, args: &[String]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    let mut mask_next = false;
    for arg in args {
        rendered.push(' ');
        if mask_next {
            rendered.push_str("***");
        } else {
            rendered.push_str(arg);
        }
        mask_next = arg == "-gp";
    }
    rendered
}
