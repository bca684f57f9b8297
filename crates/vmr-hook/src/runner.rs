//! Runs scenario pre/post hooks as host processes.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use vmr_core::result::ScenarioResult;
use vmr_core::scenario::ScenarioEvent;

use crate::command::{build_invocation, HookInvocation};
use crate::error::HookError;
use crate::macros::HookMacroContext;
use crate::types::{HookOutcome, HookStream};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub type LineObserver = Arc<dyn Fn(HookStream, &str) + Send + Sync>;

#[derive(Clone)]
pub struct HookRunner {
    result_root: PathBuf,
    observer: Option<LineObserver>,
}

impl std::fmt::Debug for HookRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRunner")
            .field("result_root", &self.result_root)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

enum Waited {
    Exited {
        status: std::io::Result<ExitStatus>,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    Cancelled,
}

impl HookRunner {
    pub fn new(result_root: impl AsRef<Path>) -> Self {
        Self {
            result_root: result_root.as_ref().to_path_buf(),
            observer: None,
        }
    }

    /// Receives every stdout/stderr line as it is read.
    pub fn with_line_observer(mut self, observer: LineObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn result_root(&self) -> &Path {
        &self.result_root
    }

    pub async fn run(
        &self,
        event: &ScenarioEvent,
        scenario_name: &str,
        result: Option<&ScenarioResult>,
    ) -> HookOutcome {
        self.run_with_cancel(event, scenario_name, result, &CancellationToken::new())
            .await
    }

    /// Never fails: spawn errors, timeouts and cancellation land in the outcome.
    pub async fn run_with_cancel(
        &self,
        event: &ScenarioEvent,
        scenario_name: &str,
        result: Option<&ScenarioResult>,
        cancel: &CancellationToken,
    ) -> HookOutcome {
        if !event.enabled {
            return HookOutcome::disabled();
        }
        let context = HookMacroContext::new(scenario_name, &self.result_root, result);
        let invocation = match build_invocation(event, &context) {
            Ok(invocation) => invocation,
            Err(err) => return HookOutcome::failed(err.to_string()),
        };
        tracing::info!(command = %invocation.render(), kind = %event.kind, "running hook");
        match self.execute(&invocation, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, "hook failed to run");
                HookOutcome::failed(err.to_string())
            }
        }
    }

    async fn execute(
        &self,
        invocation: &HookInvocation,
        cancel: &CancellationToken,
    ) -> Result<HookOutcome, HookError> {
        let rendered = invocation.render();
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }
        hide_console(&mut command, invocation.hide_window);

        let mut child = command.spawn().map_err(|source| HookError::Spawn {
            command: rendered.clone(),
            source,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let observer = self.observer.as_ref();
        let limit = Duration::from_secs(invocation.timeout_secs.max(1));

        let waited = {
            let collect = async {
                tokio::join!(
                    read_stream(stdout, HookStream::Stdout, observer),
                    read_stream(stderr, HookStream::Stderr, observer),
                    child.wait(),
                )
            };
            tokio::select! {
                _ = cancel.cancelled() => Waited::Cancelled,
                finished = tokio::time::timeout(limit, collect) => match finished {
                    Ok((stdout, stderr, status)) => Waited::Exited { status, stdout, stderr },
                    Err(_) => Waited::TimedOut,
                },
            }
        };

        match waited {
            Waited::Exited {
                status,
                stdout,
                stderr,
            } => {
                let status = status.map_err(|source| HookError::Wait {
                    command: rendered,
                    source,
                })?;
                let exit_code = status.code();
                let success = status.success();
                let error_message = if success {
                    None
                } else {
                    Some(exit_failure_message(exit_code, &stderr))
                };
                Ok(HookOutcome {
                    success,
                    exit_code,
                    stdout,
                    stderr,
                    error_message,
                    timed_out: false,
                    cancelled: false,
                })
            }
            Waited::TimedOut => {
                let _ = child.kill().await;
                tracing::warn!(command = %rendered, timeout_secs = invocation.timeout_secs, "hook timed out");
                Ok(HookOutcome {
                    timed_out: true,
                    ..HookOutcome::failed(format!(
                        "hook timed out after {} seconds",
                        invocation.timeout_secs
                    ))
                })
            }
            Waited::Cancelled => {
                let _ = child.kill().await;
                Ok(HookOutcome {
                    cancelled: true,
                    ..HookOutcome::failed("hook cancelled")
                })
            }
        }
    }
}

#[cfg(windows)]
fn hide_console(command: &mut Command, hide: bool) {
    if hide {
        command.creation_flags(CREATE_NO_WINDOW);
    }
}

#[cfg(not(windows))]
fn hide_console(_command: &mut Command, _hide: bool) {}

fn exit_failure_message(exit_code: Option<i32>, stderr: &str) -> String {
    let mut message = match exit_code {
        Some(code) => format!("Exit Code: {code}"),
        None => "terminated by signal".to_string(),
    };
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        message.push('\n');
        message.push_str(stderr);
    }
    message
}

async fn read_stream<R>(
    reader: Option<R>,
    stream: HookStream,
    observer: Option<&LineObserver>,
) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    // Raw lines so output in a non-UTF-8 code page is still drained in full.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut collected = String::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                let line = String::from_utf8_lossy(raw).into_owned();
                match stream {
                    HookStream::Stdout => tracing::debug!("[hook] {line}"),
                    HookStream::Stderr => tracing::warn!("[hook] {line}"),
                }
                if let Some(observer) = observer {
                    observer(stream, &line);
                }
                collected.push_str(&line);
                collected.push('\n');
            }
            Err(err) => {
                tracing::warn!(stream = stream.as_str(), error = %err, "stopped reading hook output");
                break;
            }
        }
    }
    collected
}
