//! The VM control interface the step executor drives.
//!
//! Implementations are interchangeable: [`crate::VmrunClient`] shells out to
//! VMware's `vmrun`, [`crate::InMemoryVm`] is scriptable for tests.

use async_trait::async_trait;
use std::path::Path;

use vmr_core::types::VmRef;

use crate::error::VmError;
use crate::types::{GuestProcessOutput, GuestProgram, Snapshot};

#[async_trait]
pub trait VmControl: Send + Sync {
    async fn connect(&self) -> Result<(), VmError>;

    fn is_connected(&self) -> bool;

    async fn power_on(&self, vm: &VmRef) -> Result<(), VmError>;

    /// Resolves once the guest agent answers, or fails after `timeout_secs`.
    async fn wait_for_guest_ready(&self, vm: &VmRef, timeout_secs: u64) -> Result<(), VmError>;

    async fn revert_to_snapshot(&self, vm: &VmRef, snapshot: &str) -> Result<(), VmError>;

    async fn login_guest(&self, vm: &VmRef, username: &str, password: &str)
        -> Result<(), VmError>;

    async fn copy_to_guest(&self, vm: &VmRef, host_path: &Path, guest_path: &str)
        -> Result<(), VmError>;

    async fn copy_from_guest(
        &self,
        vm: &VmRef,
        guest_path: &str,
        host_path: &Path,
    ) -> Result<(), VmError>;

    async fn create_guest_directory(&self, vm: &VmRef, guest_path: &str) -> Result<(), VmError>;

    /// A guest program that runs but exits non-zero is `Ok` with `success == false`.
    /// Exceeding the timeout is [`VmError::Timeout`].
    async fn run_program_in_guest(
        &self,
        vm: &VmRef,
        program: &GuestProgram,
    ) -> Result<GuestProcessOutput, VmError>;

    async fn run_script_in_guest(
        &self,
        vm: &VmRef,
        interpreter: &str,
        script: &str,
        timeout_secs: u64,
    ) -> Result<GuestProcessOutput, VmError>;

    async fn capture_screenshot(&self, vm: &VmRef, host_path: &Path) -> Result<(), VmError>;

    async fn list_snapshots(&self, vm: &VmRef) -> Result<Vec<Snapshot>, VmError>;

    async fn disconnect_network(&self, vm: &VmRef) -> Result<(), VmError>;
}

/// Parent directory of a guest path, split on either separator.
pub fn guest_parent_dir(guest_path: &str) -> Option<&str> {
    let idx = guest_path.rfind(|c: char| c == '\\' || c == '/')?;
    let parent = &guest_path[..idx];
    if parent.is_empty() || parent.ends_with(':') {
        return None;
    }
    Some(parent)
}

#[cfg(test)]
mod tests {
    use super::guest_parent_dir;

    #[test]
    fn guest_parent_dir_handles_both_separators() {
        assert_eq!(guest_parent_dir("C:\\test\\in\\a.exe"), Some("C:\\test\\in"));
        assert_eq!(guest_parent_dir("/tmp/work/a.sh"), Some("/tmp/work"));
        assert_eq!(guest_parent_dir("C:\\a.exe"), None);
        assert_eq!(guest_parent_dir("a.exe"), None);
        assert_eq!(guest_parent_dir("/a.sh"), None);
    }
}
