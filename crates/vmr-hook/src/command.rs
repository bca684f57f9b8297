use std::path::PathBuf;

use vmr_core::cmdline::split_windows_args;
use vmr_core::scenario::{HookKind, ScenarioEvent};

use crate::error::HookError;
use crate::macros::HookMacroContext;

/// Shell family used to launch hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostShell {
    Windows,
    Posix,
}

impl HostShell {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostShell::Windows
        } else {
            HostShell::Posix
        }
    }
}

/// Fully resolved process launch for one hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub hide_window: bool,
    pub timeout_secs: u64,
}

impl HookInvocation {
    pub fn render(&self) -> String {
        if self.args.is_empty() {
            return self.program.clone();
        }
        format!("{} {}", self.program, self.args.join(" "))
    }
}

pub fn build_invocation(
    event: &ScenarioEvent,
    context: &HookMacroContext,
) -> Result<HookInvocation, HookError> {
    build_invocation_for(event, context, HostShell::current())
}

pub fn build_invocation_for(
    event: &ScenarioEvent,
    context: &HookMacroContext,
    shell: HostShell,
) -> Result<HookInvocation, HookError> {
    let command = context.expand(event.command.trim());
    if command.is_empty() {
        return Err(HookError::InvalidEvent {
            message: "command must not be empty".to_string(),
        });
    }
    let arguments = context.expand(event.arguments.trim());
    let split_args = split_arguments(&arguments, shell);

    let (program, args) = match (shell, event.kind) {
        (HostShell::Windows, HookKind::InterpreterScript) => (
            "powershell.exe".to_string(),
            prefixed(&["-ExecutionPolicy", "Bypass", "-File"], &command, split_args),
        ),
        (HostShell::Windows, HookKind::BatchFile | HookKind::Command) => {
            ("cmd.exe".to_string(), prefixed(&["/c"], &command, split_args))
        }
        (HostShell::Posix, HookKind::InterpreterScript) => (
            "pwsh".to_string(),
            prefixed(&["-ExecutionPolicy", "Bypass", "-File"], &command, split_args),
        ),
        (HostShell::Posix, HookKind::BatchFile) => {
            ("sh".to_string(), prefixed(&[], &command, split_args))
        }
        (HostShell::Posix, HookKind::Command) => {
            let line = if arguments.is_empty() {
                command
            } else {
                format!("{command} {arguments}")
            };
            ("sh".to_string(), vec!["-c".to_string(), line])
        }
        (_, HookKind::Executable) => (command, split_args),
    };

    let working_dir = event
        .working_dir
        .as_deref()
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .map(|dir| PathBuf::from(context.expand(dir)));

    let mut env: Vec<(String, String)> = event
        .env
        .iter()
        .map(|(key, value)| (key.clone(), context.expand(value)))
        .collect();
    env.extend(context.fixed_env());

    Ok(HookInvocation {
        program,
        args,
        working_dir,
        env,
        hide_window: event.hide_window,
        timeout_secs: event.timeout_secs,
    })
}

fn prefixed(prefix: &[&str], command: &str, rest: Vec<String>) -> Vec<String> {
    let mut args: Vec<String> = prefix.iter().map(|part| part.to_string()).collect();
    args.push(command.to_string());
    args.extend(rest);
    args
}

/// Windows hosts read the argument string with Windows quoting, so
/// backslashes in paths are never treated as escapes.
fn split_arguments(arguments: &str, shell: HostShell) -> Vec<String> {
    match shell {
        HostShell::Windows => split_windows_args(arguments),
        HostShell::Posix if arguments.is_empty() => Vec::new(),
        HostShell::Posix => shell_words::split(arguments)
            .unwrap_or_else(|_| arguments.split_whitespace().map(str::to_string).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use std::path::Path;
    use vmr_core::placeholder::dated_result_dir;

    fn context() -> HookMacroContext {
        HookMacroContext::new("Regression", "results", None)
    }

    #[test]
    fn windows_script_hook_runs_through_powershell_bypass() {
        let mut event = ScenarioEvent::new(HookKind::InterpreterScript, "prepare.ps1");
        event.arguments = "-Name {ScenarioName}".to_string();

        let invocation = build_invocation_for(&event, &context(), HostShell::Windows)
            .expect("build invocation");
        assert_eq!(invocation.program, "powershell.exe");
        assert_eq!(
            invocation.args,
            vec!["-ExecutionPolicy", "Bypass", "-File", "prepare.ps1", "-Name", "Regression"]
        );
    }

    #[test]
    fn windows_command_and_batch_go_through_cmd() {
        let event = ScenarioEvent::new(HookKind::BatchFile, "setup.bat");
        let invocation = build_invocation_for(&event, &context(), HostShell::Windows)
            .expect("build invocation");
        assert_eq!(invocation.program, "cmd.exe");
        assert_eq!(invocation.args, vec!["/c", "setup.bat"]);
        assert_eq!(invocation.render(), "cmd.exe /c setup.bat");
    }

    #[test]
    fn posix_command_hook_joins_arguments_into_one_shell_line() {
        let mut event = ScenarioEvent::new(HookKind::Command, "echo");
        event.arguments = "{ScenarioName} done".to_string();

        let invocation =
            build_invocation_for(&event, &context(), HostShell::Posix).expect("build invocation");
        assert_eq!(invocation.program, "sh");
        assert_eq!(invocation.args, vec!["-c", "echo Regression done"]);
    }

    #[test]
    fn executable_hook_runs_directly_with_quoted_arguments() {
        let mut event = ScenarioEvent::new(HookKind::Executable, "/opt/tools/notify");
        event.arguments = "--title \"nightly run\" -v".to_string();

        let invocation =
            build_invocation_for(&event, &context(), HostShell::Posix).expect("build invocation");
        assert_eq!(invocation.program, "/opt/tools/notify");
        assert_eq!(invocation.args, vec!["--title", "nightly run", "-v"]);
    }

    #[test]
    fn windows_hook_arguments_keep_backslashes() {
        let now = Local
            .with_ymd_and_hms(2026, 10, 19, 21, 30, 0)
            .single()
            .expect("valid time");
        let context = HookMacroContext::new("Regression", r"D:\results", None).at(now);
        let result_dir = dated_result_dir(Path::new(r"D:\results"), now);

        let mut event = ScenarioEvent::new(HookKind::Executable, r"C:\tools\report.exe");
        event.arguments = r#"{ResultDir}\summary.txt --log C:\logs\out.txt "C:\Program Files\x""#
            .to_string();
        let invocation = build_invocation_for(&event, &context, HostShell::Windows)
            .expect("build invocation");
        assert_eq!(invocation.program, r"C:\tools\report.exe");
        assert_eq!(
            invocation.args,
            vec![
                format!("{}\\summary.txt", result_dir.display()),
                "--log".to_string(),
                r"C:\logs\out.txt".to_string(),
                r"C:\Program Files\x".to_string(),
            ]
        );

        let mut batch = ScenarioEvent::new(HookKind::BatchFile, r"C:\hooks\collect.bat");
        batch.arguments = r"D:\out\run1 /q".to_string();
        let invocation = build_invocation_for(&batch, &context, HostShell::Windows)
            .expect("build invocation");
        assert_eq!(
            invocation.args,
            vec!["/c", r"C:\hooks\collect.bat", r"D:\out\run1", "/q"]
        );
    }

    #[test]
    fn user_env_is_expanded_and_fixed_env_appended() {
        let mut event = ScenarioEvent::new(HookKind::Command, "true");
        event
            .env
            .insert("RUN_LABEL".to_string(), "{ScenarioName}-label".to_string());
        event.working_dir = Some("   ".to_string());

        let invocation =
            build_invocation_for(&event, &context(), HostShell::Posix).expect("build invocation");
        assert!(invocation
            .env
            .contains(&("RUN_LABEL".to_string(), "Regression-label".to_string())));
        assert!(invocation
            .env
            .contains(&("SCENARIO_NAME".to_string(), "Regression".to_string())));
        assert!(invocation.working_dir.is_none());
    }

    #[test]
    fn empty_command_is_rejected() {
        let event = ScenarioEvent::new(HookKind::Command, "  ");
        let err = build_invocation_for(&event, &context(), HostShell::Posix)
            .expect_err("empty command should fail");
        assert!(matches!(err, HookError::InvalidEvent { .. }));
    }
}
