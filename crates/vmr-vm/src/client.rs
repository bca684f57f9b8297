use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use vmr_core::cmdline::split_windows_args;
use vmr_core::types::VmRef;

use crate::command::{vmrun_binary_name, GuestCredentials, VmrunCli, VmrunCommand, VmrunOutput};
use crate::control::VmControl;
use crate::error::{failure_text, VmError};
use crate::types::{
    parse_guest_exit_code, parse_list_snapshots, parse_running_vms, GuestProcessOutput,
    GuestProgram, Snapshot,
};

const PROBE_TIMEOUT_SECS: u64 = 10;
const TOOLS_POLL_INTERVAL: Duration = Duration::from_secs(2);
const NETWORK_DEVICE: &str = "ethernet0";

/// Default VMware install locations searched after the configured ones.
pub fn default_install_dirs() -> Vec<PathBuf> {
    if cfg!(windows) {
        vec![
            PathBuf::from(r"C:\Program Files (x86)\VMware\VMware Workstation"),
            PathBuf::from(r"C:\Program Files\VMware\VMware Workstation"),
        ]
    } else {
        vec![
            PathBuf::from("/usr/bin"),
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/Applications/VMware Fusion.app/Contents/Library"),
        ]
    }
}

/// Explicit path first, then each install dir joined with the binary name.
pub fn resolve_vmrun_binary(
    explicit: Option<&Path>,
    install_dirs: &[PathBuf],
) -> Result<PathBuf, VmError> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.extend(
        install_dirs
            .iter()
            .chain(default_install_dirs().iter())
            .map(|dir| dir.join(vmrun_binary_name())),
    );

    match candidates.iter().find(|path| path.is_file()) {
        Some(found) => Ok(found.clone()),
        None => Err(VmError::BinaryNotFound {
            searched: candidates,
        }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// [`VmControl`] backed by the `vmrun` CLI.
#[derive(Debug)]
pub struct VmrunClient {
    explicit_binary: Option<PathBuf>,
    install_dirs: Vec<PathBuf>,
    cli: Mutex<Option<VmrunCli>>,
    credentials: Mutex<HashMap<String, GuestCredentials>>,
    connected: AtomicBool,
}

impl VmrunClient {
    pub fn new(explicit_binary: Option<PathBuf>, install_dirs: Vec<PathBuf>) -> Self {
        Self {
            explicit_binary,
            install_dirs,
            cli: Mutex::new(None),
            credentials: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_cli(cli: VmrunCli) -> Self {
        let client = Self::new(Some(cli.binary.clone()), Vec::new());
        *lock(&client.cli) = Some(cli);
        client
    }

    pub fn disconnect(&self) {
        lock(&self.credentials).clear();
        self.connected.store(false, Ordering::SeqCst);
    }

    /// `.vmx` paths of the VMs currently powered on.
    pub async fn list_running(&self) -> Result<Vec<VmRef>, VmError> {
        let output = self.exec_checked(VmrunCommand::List, None, Vec::new(), None).await?;
        Ok(parse_running_vms(&output.stdout))
    }

    fn cli(&self) -> Result<VmrunCli, VmError> {
        lock(&self.cli).clone().ok_or(VmError::NotConnected)
    }

    fn credentials_for(&self, vm: &VmRef) -> Result<GuestCredentials, VmError> {
        lock(&self.credentials)
            .get(vm.as_str())
            .cloned()
            .ok_or_else(|| VmError::NotLoggedIn {
                vm: vm.to_string(),
            })
    }

    fn forget_credentials(&self, vm: &VmRef) {
        lock(&self.credentials).remove(vm.as_str());
    }

    async fn exec(
        &self,
        command: VmrunCommand,
        credentials: Option<&GuestCredentials>,
        args: Vec<String>,
        timeout_secs: Option<u64>,
    ) -> Result<VmrunOutput, VmError> {
        let cli = self.cli()?;
        let timeout_secs = timeout_secs.unwrap_or_else(|| command.default_timeout_secs());
        cli.run(command, credentials, &args, timeout_secs).await
    }

    async fn exec_checked(
        &self,
        command: VmrunCommand,
        credentials: Option<&GuestCredentials>,
        args: Vec<String>,
        timeout_secs: Option<u64>,
    ) -> Result<VmrunOutput, VmError> {
        let cli = self.cli()?;
        let timeout_secs = timeout_secs.unwrap_or_else(|| command.default_timeout_secs());
        cli.run_checked(command, credentials, &args, timeout_secs)
            .await
    }

    async fn run_guest(
        &self,
        command: VmrunCommand,
        vm: &VmRef,
        args: Vec<String>,
        timeout_secs: u64,
    ) -> Result<GuestProcessOutput, VmError> {
        let credentials = self.credentials_for(vm)?;
        let output = self
            .exec(command, Some(&credentials), args, Some(timeout_secs))
            .await?;
        Ok(guest_output_from(output))
    }
}

fn guest_output_from(output: VmrunOutput) -> GuestProcessOutput {
    if output.success() {
        return GuestProcessOutput {
            exit_code: Some(0),
            stdout: output.stdout,
            stderr: output.stderr,
            success: true,
            error_message: None,
        };
    }

    let exit_code = parse_guest_exit_code(&output.stdout)
        .or_else(|| parse_guest_exit_code(&output.stderr))
        .or(output.status);
    let message = failure_text(&output.stdout, &output.stderr);
    GuestProcessOutput {
        exit_code,
        error_message: (!message.is_empty()).then_some(message),
        stdout: output.stdout,
        stderr: output.stderr,
        success: false,
    }
}

/// `runProgramInGuest` arguments. The guest is Windows, so the argument
/// string is split with Windows quoting and backslashes stay literal.
fn program_args(vm: &VmRef, program: &GuestProgram) -> Vec<String> {
    let mut args = vec![vm.to_string()];
    if !program.wait_for_exit {
        args.push("-noWait".to_string());
    }
    args.push("-activeWindow".to_string());
    args.push(program.program.clone());
    args.extend(split_windows_args(&program.arguments));
    args
}

fn ensure_host_parent(path: &Path) -> Result<(), VmError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| VmError::HostIo {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

#[async_trait]
impl VmControl for VmrunClient {
    async fn connect(&self) -> Result<(), VmError> {
        let binary =
            resolve_vmrun_binary(self.explicit_binary.as_deref(), &self.install_dirs)?;
        let cli = VmrunCli::new(binary);
        cli.run(VmrunCommand::List, None, &[], PROBE_TIMEOUT_SECS)
            .await?;
        tracing::info!(binary = %cli.binary.display(), "vmrun connected");
        *lock(&self.cli) = Some(cli);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn power_on(&self, vm: &VmRef) -> Result<(), VmError> {
        self.exec_checked(
            VmrunCommand::Start,
            None,
            vec![vm.to_string(), "nogui".to_string()],
            None,
        )
        .await?;
        Ok(())
    }

    async fn wait_for_guest_ready(&self, vm: &VmRef, timeout_secs: u64) -> Result<(), VmError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(VmError::Timeout {
                    command: format!("checkToolsState {vm}"),
                    timeout_secs,
                });
            }
            let output = self
                .exec(
                    VmrunCommand::CheckToolsState,
                    None,
                    vec![vm.to_string()],
                    Some(remaining.as_secs().max(1)),
                )
                .await?;
            if output.stdout.to_ascii_lowercase().contains("running") {
                return Ok(());
            }
            tokio::time::sleep(TOOLS_POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn revert_to_snapshot(&self, vm: &VmRef, snapshot: &str) -> Result<(), VmError> {
        let result = self
            .exec_checked(
                VmrunCommand::RevertToSnapshot,
                None,
                vec![vm.to_string(), snapshot.to_string()],
                None,
            )
            .await;
        // the guest session is gone either way
        self.forget_credentials(vm);
        result.map(|_| ())
    }

    async fn login_guest(
        &self,
        vm: &VmRef,
        username: &str,
        password: &str,
    ) -> Result<(), VmError> {
        lock(&self.credentials).insert(
            vm.to_string(),
            GuestCredentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        Ok(())
    }

    async fn copy_to_guest(
        &self,
        vm: &VmRef,
        host_path: &Path,
        guest_path: &str,
    ) -> Result<(), VmError> {
        let credentials = self.credentials_for(vm)?;
        self.exec_checked(
            VmrunCommand::CopyFileFromHostToGuest,
            Some(&credentials),
            vec![
                vm.to_string(),
                host_path.display().to_string(),
                guest_path.to_string(),
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn copy_from_guest(
        &self,
        vm: &VmRef,
        guest_path: &str,
        host_path: &Path,
    ) -> Result<(), VmError> {
        let credentials = self.credentials_for(vm)?;
        ensure_host_parent(host_path)?;
        self.exec_checked(
            VmrunCommand::CopyFileFromGuestToHost,
            Some(&credentials),
            vec![
                vm.to_string(),
                guest_path.to_string(),
                host_path.display().to_string(),
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn create_guest_directory(&self, vm: &VmRef, guest_path: &str) -> Result<(), VmError> {
        let credentials = self.credentials_for(vm)?;
        self.exec_checked(
            VmrunCommand::CreateDirectoryInGuest,
            Some(&credentials),
            vec![vm.to_string(), guest_path.to_string()],
            None,
        )
        .await?;
        Ok(())
    }

    async fn run_program_in_guest(
        &self,
        vm: &VmRef,
        program: &GuestProgram,
    ) -> Result<GuestProcessOutput, VmError> {
        self.run_guest(
            VmrunCommand::RunProgramInGuest,
            vm,
            program_args(vm, program),
            program.timeout_secs,
        )
        .await
    }

    async fn run_script_in_guest(
        &self,
        vm: &VmRef,
        interpreter: &str,
        script: &str,
        timeout_secs: u64,
    ) -> Result<GuestProcessOutput, VmError> {
        self.run_guest(
            VmrunCommand::RunScriptInGuest,
            vm,
            vec![vm.to_string(), interpreter.to_string(), script.to_string()],
            timeout_secs,
        )
        .await
    }

    async fn capture_screenshot(&self, vm: &VmRef, host_path: &Path) -> Result<(), VmError> {
        let credentials = self.credentials_for(vm).ok();
        ensure_host_parent(host_path)?;
        self.exec_checked(
            VmrunCommand::CaptureScreen,
            credentials.as_ref(),
            vec![vm.to_string(), host_path.display().to_string()],
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_snapshots(&self, vm: &VmRef) -> Result<Vec<Snapshot>, VmError> {
        let output = self
            .exec_checked(VmrunCommand::ListSnapshots, None, vec![vm.to_string()], None)
            .await?;
        Ok(parse_list_snapshots(&output.stdout))
    }

    async fn disconnect_network(&self, vm: &VmRef) -> Result<(), VmError> {
        self.exec_checked(
            VmrunCommand::DisconnectNamedDevice,
            None,
            vec![vm.to_string(), NETWORK_DEVICE.to_string()],
            None,
        )
        .await?;
        Ok(())
    }
}
