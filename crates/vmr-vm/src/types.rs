use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use vmr_core::types::VmRef;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
}

/// A program to start inside the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestProgram {
    pub program: String,
    pub arguments: String,
    pub timeout_secs: u64,
    pub wait_for_exit: bool,
}

impl GuestProgram {
    pub fn new(program: impl Into<String>, arguments: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            program: program.into(),
            arguments: arguments.into(),
            timeout_secs,
            wait_for_exit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuestProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub error_message: Option<String>,
}

impl GuestProcessOutput {
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            error_message: None,
        }
    }

    pub fn exited(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: String::new(),
            success: code == 0,
            error_message: (code != 0).then(|| format!("Exit Code: {code}")),
        }
    }
}

/// A VM entry read from VMware's `inventory.vmls`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub name: String,
    pub vmx_path: VmRef,
}

/// Lines of `vmrun listSnapshots`, minus the `Total snapshots: N` header.
pub fn parse_list_snapshots(raw: &str) -> Vec<Snapshot> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Total"))
        .map(|line| Snapshot {
            name: line.to_string(),
        })
        .collect()
}

/// `.vmx` paths from `vmrun list`.
pub fn parse_running_vms(raw: &str) -> Vec<VmRef> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("Total"))
        .filter(|line| line.to_ascii_lowercase().ends_with(".vmx"))
        .map(VmRef::new)
        .collect()
}

/// Pull the guest exit code out of vmrun's
/// `Guest program exited with non-zero exit code: N` message.
pub fn parse_guest_exit_code(raw: &str) -> Option<i32> {
    const MARKER: &str = "exit code:";
    raw.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        let idx = lower.find(MARKER)?;
        line[idx + MARKER.len()..].trim().parse::<i32>().ok()
    })
}

/// `vmlistN.config` / `vmlistN.DisplayName` pairs from `inventory.vmls`.
///
/// Entries without a config path are dropped. Missing display names fall back
/// to the vmx file stem.
pub fn parse_inventory(raw: &str) -> Vec<InventoryEntry> {
    let mut entries: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

    for line in raw.lines() {
        let trimmed = line.trim();
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !key.starts_with("vmlist") {
            continue;
        }
        let Some((vm_key, property)) = key.split_once('.') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        entries
            .entry(vm_key.to_string())
            .or_default()
            .insert(property.to_string(), value);
    }

    let mut out = Vec::new();
    for properties in entries.values() {
        let Some(config) = properties.get("config").filter(|path| !path.is_empty()) else {
            continue;
        };
        let vmx_path = VmRef::new(config.clone());
        let name = properties
            .get("DisplayName")
            .filter(|name| !name.is_empty())
            .cloned()
            .unwrap_or_else(|| vmx_path.fallback_name());
        out.push(InventoryEntry { name, vmx_path });
    }
    out
}
