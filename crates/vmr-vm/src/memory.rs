//! Scriptable in-process [`VmControl`] used by executor and orchestrator tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use vmr_core::types::VmRef;

use crate::control::VmControl;
use crate::error::VmError;
use crate::types::{GuestProcessOutput, GuestProgram, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmOperation {
    Connect,
    PowerOn,
    WaitForGuest,
    Revert,
    Login,
    CopyToGuest,
    CopyFromGuest,
    CreateDirectory,
    RunProgram,
    RunScript,
    Screenshot,
    ListSnapshots,
    DisconnectNetwork,
}

impl VmOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            VmOperation::Connect => "connect",
            VmOperation::PowerOn => "power_on",
            VmOperation::WaitForGuest => "wait_for_guest",
            VmOperation::Revert => "revert",
            VmOperation::Login => "login",
            VmOperation::CopyToGuest => "copy_to_guest",
            VmOperation::CopyFromGuest => "copy_from_guest",
            VmOperation::CreateDirectory => "create_directory",
            VmOperation::RunProgram => "run_program",
            VmOperation::RunScript => "run_script",
            VmOperation::Screenshot => "screenshot",
            VmOperation::ListSnapshots => "list_snapshots",
            VmOperation::DisconnectNetwork => "disconnect_network",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmCall {
    pub operation: VmOperation,
    pub vm: String,
    pub detail: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    calls: Vec<VmCall>,
    current_snapshot: HashMap<String, String>,
    known_snapshots: HashMap<String, Vec<String>>,
    logins: HashMap<String, (String, String)>,
    guest_files: HashSet<(String, String)>,
    failures: HashSet<(VmOperation, Option<String>)>,
    outputs: HashMap<String, GuestProcessOutput>,
    timeouts: HashSet<String>,
    program_delay: Duration,
    boot_delay: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Records every call, tracks each VM's current snapshot, and can inject
/// failures, delays, canned guest output and timeouts.
#[derive(Debug, Default)]
pub struct InMemoryVm {
    state: Mutex<MemoryState>,
    connected: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryVm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts already connected.
    pub fn connected() -> Self {
        let vm = Self::default();
        vm.connected.store(true, Ordering::SeqCst);
        vm
    }

    /// Fail `operation` on every VM.
    pub fn fail_on(&self, operation: VmOperation) {
        lock(&self.state).failures.insert((operation, None));
    }

    /// Fail `operation` on one VM.
    pub fn fail_on_vm(&self, operation: VmOperation, vm: &VmRef) {
        lock(&self.state)
            .failures
            .insert((operation, Some(vm.to_string())));
    }

    /// Canned output for a program or script invocation, keyed by program path.
    pub fn set_output(&self, program: impl Into<String>, output: GuestProcessOutput) {
        lock(&self.state).outputs.insert(program.into(), output);
    }

    /// Running this program exceeds its timeout.
    pub fn time_out_program(&self, program: impl Into<String>) {
        lock(&self.state).timeouts.insert(program.into());
    }

    pub fn set_program_delay(&self, delay: Duration) {
        lock(&self.state).program_delay = delay;
    }

    pub fn set_boot_delay(&self, delay: Duration) {
        lock(&self.state).boot_delay = delay;
    }

    /// Restrict the snapshots a VM accepts. VMs without a list accept any name.
    pub fn set_snapshots(&self, vm: &VmRef, names: &[&str]) {
        lock(&self.state).known_snapshots.insert(
            vm.to_string(),
            names.iter().map(|name| name.to_string()).collect(),
        );
    }

    pub fn add_guest_file(&self, vm: &VmRef, guest_path: impl Into<String>) {
        lock(&self.state)
            .guest_files
            .insert((vm.to_string(), guest_path.into()));
    }

    pub fn calls(&self) -> Vec<VmCall> {
        lock(&self.state).calls.clone()
    }

    pub fn count(&self, operation: VmOperation) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    pub fn operations(&self) -> Vec<VmOperation> {
        lock(&self.state)
            .calls
            .iter()
            .map(|call| call.operation)
            .collect()
    }

    pub fn current_snapshot(&self, vm: &VmRef) -> Option<String> {
        lock(&self.state).current_snapshot.get(vm.as_str()).cloned()
    }

    pub fn has_guest_file(&self, vm: &VmRef, guest_path: &str) -> bool {
        lock(&self.state)
            .guest_files
            .contains(&(vm.to_string(), guest_path.to_string()))
    }

    /// Most guest programs observed running at once.
    pub fn peak_concurrent_programs(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn record(
        &self,
        operation: VmOperation,
        vm: &VmRef,
        detail: impl Into<String>,
    ) -> Result<(), VmError> {
        let mut state = lock(&self.state);
        state.calls.push(VmCall {
            operation,
            vm: vm.to_string(),
            detail: detail.into(),
        });
        let fails = state.failures.contains(&(operation, None))
            || state
                .failures
                .contains(&(operation, Some(vm.to_string())));
        if fails {
            return Err(VmError::OperationFailed {
                operation: operation.as_str(),
                vm: vm.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn require_login(&self, vm: &VmRef) -> Result<(), VmError> {
        if lock(&self.state).logins.contains_key(vm.as_str()) {
            Ok(())
        } else {
            Err(VmError::NotLoggedIn { vm: vm.to_string() })
        }
    }

    async fn run_guest(
        &self,
        operation: VmOperation,
        vm: &VmRef,
        key: &str,
        timeout_secs: u64,
    ) -> Result<GuestProcessOutput, VmError> {
        self.record(operation, vm, key)?;
        self.require_login(vm)?;

        let (delay, times_out, output) = {
            let state = lock(&self.state);
            (
                state.program_delay,
                state.timeouts.contains(key),
                state
                    .outputs
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| GuestProcessOutput::succeeded("")),
            )
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if times_out {
            return Err(VmError::Timeout {
                command: format!("{} {key}", operation.as_str()),
                timeout_secs,
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl VmControl for InMemoryVm {
    async fn connect(&self) -> Result<(), VmError> {
        self.record(VmOperation::Connect, &VmRef::default(), "")?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn power_on(&self, vm: &VmRef) -> Result<(), VmError> {
        self.record(VmOperation::PowerOn, vm, "")
    }

    async fn wait_for_guest_ready(&self, vm: &VmRef, timeout_secs: u64) -> Result<(), VmError> {
        self.record(VmOperation::WaitForGuest, vm, timeout_secs.to_string())?;
        let delay = lock(&self.state).boot_delay;
        if delay > Duration::from_secs(timeout_secs) {
            return Err(VmError::Timeout {
                command: format!("checkToolsState {vm}"),
                timeout_secs,
            });
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn revert_to_snapshot(&self, vm: &VmRef, snapshot: &str) -> Result<(), VmError> {
        self.record(VmOperation::Revert, vm, snapshot)?;
        let mut state = lock(&self.state);
        if let Some(known) = state.known_snapshots.get(vm.as_str()) {
            if !known.iter().any(|name| name == snapshot) {
                return Err(VmError::OperationFailed {
                    operation: VmOperation::Revert.as_str(),
                    vm: vm.to_string(),
                    message: format!("snapshot {snapshot:?} not found"),
                });
            }
        }
        state
            .current_snapshot
            .insert(vm.to_string(), snapshot.to_string());
        state.logins.remove(vm.as_str());
        Ok(())
    }

    async fn login_guest(
        &self,
        vm: &VmRef,
        username: &str,
        password: &str,
    ) -> Result<(), VmError> {
        self.record(VmOperation::Login, vm, username)?;
        lock(&self.state)
            .logins
            .insert(vm.to_string(), (username.to_string(), password.to_string()));
        Ok(())
    }

    async fn copy_to_guest(
        &self,
        vm: &VmRef,
        host_path: &Path,
        guest_path: &str,
    ) -> Result<(), VmError> {
        self.record(
            VmOperation::CopyToGuest,
            vm,
            format!("{} -> {guest_path}", host_path.display()),
        )?;
        self.require_login(vm)?;
        self.add_guest_file(vm, guest_path);
        Ok(())
    }

    async fn copy_from_guest(
        &self,
        vm: &VmRef,
        guest_path: &str,
        host_path: &Path,
    ) -> Result<(), VmError> {
        self.record(
            VmOperation::CopyFromGuest,
            vm,
            format!("{guest_path} -> {}", host_path.display()),
        )?;
        self.require_login(vm)?;
        if !self.has_guest_file(vm, guest_path) {
            return Err(VmError::OperationFailed {
                operation: VmOperation::CopyFromGuest.as_str(),
                vm: vm.to_string(),
                message: format!("guest file {guest_path} not found"),
            });
        }
        if let Some(parent) = host_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| VmError::HostIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(host_path, guest_path.as_bytes()).map_err(|source| VmError::HostIo {
            path: host_path.to_path_buf(),
            source,
        })
    }

    async fn create_guest_directory(&self, vm: &VmRef, guest_path: &str) -> Result<(), VmError> {
        self.record(VmOperation::CreateDirectory, vm, guest_path)?;
        self.require_login(vm)
    }

    async fn run_program_in_guest(
        &self,
        vm: &VmRef,
        program: &GuestProgram,
    ) -> Result<GuestProcessOutput, VmError> {
        self.run_guest(
            VmOperation::RunProgram,
            vm,
            &program.program,
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
        let key = if lock(&self.state).outputs.contains_key(script) {
            script.to_string()
        } else {
            interpreter.to_string()
        };
        self.run_guest(VmOperation::RunScript, vm, &key, timeout_secs)
            .await
    }

    async fn capture_screenshot(&self, vm: &VmRef, host_path: &Path) -> Result<(), VmError> {
        self.record(VmOperation::Screenshot, vm, host_path.display().to_string())?;
        if let Some(parent) = host_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| VmError::HostIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(host_path, b"").map_err(|source| VmError::HostIo {
            path: host_path.to_path_buf(),
            source,
        })
    }

    async fn list_snapshots(&self, vm: &VmRef) -> Result<Vec<Snapshot>, VmError> {
        self.record(VmOperation::ListSnapshots, vm, "")?;
        Ok(lock(&self.state)
            .known_snapshots
            .get(vm.as_str())
            .map(|names| {
                names
                    .iter()
                    .map(|name| Snapshot { name: name.clone() })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn disconnect_network(&self, vm: &VmRef) -> Result<(), VmError> {
        self.record(VmOperation::DisconnectNetwork, vm, "")
    }
}
