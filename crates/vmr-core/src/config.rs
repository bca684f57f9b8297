//! Application settings loaded from `config/vmregress.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::VmRef;

pub const DEFAULT_SETTINGS_PATH: &str = "config/vmregress.toml";
pub const DEFAULT_BOOT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_GUEST_USERNAME: &str = "Administrator";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to create config parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn default_result_root() -> PathBuf {
    PathBuf::from("results")
}

fn default_scenarios_dir() -> PathBuf {
    PathBuf::from("scenarios")
}

fn default_history_db() -> PathBuf {
    PathBuf::from(".vmregress/history.sqlite")
}

fn default_boot_timeout() -> u64 {
    DEFAULT_BOOT_TIMEOUT_SECS
}

fn default_guest_username() -> String {
    DEFAULT_GUEST_USERNAME.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Explicit `vmrun` binary. Falls back to searching `install_dirs`.
    #[serde(default)]
    pub vmrun_path: Option<PathBuf>,
    #[serde(default)]
    pub install_dirs: Vec<PathBuf>,
    #[serde(default = "default_result_root")]
    pub result_root: PathBuf,
    #[serde(default = "default_scenarios_dir")]
    pub scenarios_dir: PathBuf,
    #[serde(default = "default_history_db")]
    pub history_db: PathBuf,
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,
    #[serde(default = "default_guest_username")]
    pub default_guest_username: String,
    #[serde(default)]
    pub notification: NotificationSettings,
    #[serde(default)]
    pub registered_vms: Vec<VmInfo>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vmrun_path: None,
            install_dirs: Vec::new(),
            result_root: default_result_root(),
            scenarios_dir: default_scenarios_dir(),
            history_db: default_history_db(),
            boot_timeout_secs: DEFAULT_BOOT_TIMEOUT_SECS,
            default_guest_username: default_guest_username(),
            notification: NotificationSettings::default(),
            registered_vms: Vec::new(),
        }
    }
}

/// A VM known to the tool, with its guest credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub vmx_path: VmRef,
    #[serde(default)]
    pub guest_username: Option<String>,
    #[serde(default)]
    pub guest_password: Option<String>,
}

impl VmInfo {
    /// Unregistered VM: named after its vmx file, no credentials.
    pub fn unregistered(vm: &VmRef) -> Self {
        Self {
            name: vm.fallback_name(),
            vmx_path: vm.clone(),
            guest_username: None,
            guest_password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSinkKind {
    #[default]
    None,
    Stdout,
    Webhook,
    Slack,
    Teams,
}

impl NotificationSinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationSinkKind::None => "none",
            NotificationSinkKind::Stdout => "stdout",
            NotificationSinkKind::Webhook => "webhook",
            NotificationSinkKind::Slack => "slack",
            NotificationSinkKind::Teams => "teams",
        }
    }
}

impl std::fmt::Display for NotificationSinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sink: NotificationSinkKind,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    #[serde(default)]
    pub teams_webhook_url: Option<String>,
    #[serde(default)]
    pub notify_on_start: bool,
    #[serde(default = "default_true")]
    pub notify_on_complete: bool,
    #[serde(default = "default_true")]
    pub notify_on_failure: bool,
    #[serde(default = "default_true")]
    pub notify_on_error: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sink: NotificationSinkKind::None,
            webhook_url: None,
            slack_webhook_url: None,
            teams_webhook_url: None,
            notify_on_start: false,
            notify_on_complete: true,
            notify_on_failure: true,
            notify_on_error: true,
        }
    }
}

impl NotificationSettings {
    /// URL the configured sink posts to, if it needs one.
    pub fn target_url(&self) -> Option<&str> {
        match self.sink {
            NotificationSinkKind::Webhook => self.webhook_url.as_deref(),
            NotificationSinkKind::Slack => self.slack_webhook_url.as_deref(),
            NotificationSinkKind::Teams => self.teams_webhook_url.as_deref(),
            NotificationSinkKind::None | NotificationSinkKind::Stdout => None,
        }
    }
}

impl Settings {
    pub fn find_vm(&self, vm: &VmRef) -> Option<&VmInfo> {
        self.registered_vms
            .iter()
            .find(|info| info.vmx_path.as_str().eq_ignore_ascii_case(vm.as_str()))
    }

    pub fn find_vm_by_name(&self, name: &str) -> Option<&VmInfo> {
        self.registered_vms
            .iter()
            .find(|info| info.name.eq_ignore_ascii_case(name))
    }
}

pub fn parse_settings(contents: &str) -> Result<Settings, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_settings(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_settings(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

/// Missing file yields defaults. Unreadable or malformed files are errors.
pub fn load_settings_or_default(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let path_ref = path.as_ref();
    if !path_ref.exists() {
        return Ok(Settings::default());
    }
    load_settings(path_ref)
}

pub fn save_settings(path: impl AsRef<Path>, settings: &Settings) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    if let Some(parent_dir) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent_dir).map_err(|source| ConfigError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;
    }

    let body = toml::to_string_pretty(settings).map_err(|source| ConfigError::Serialize {
        path: path_ref.to_path_buf(),
        source,
    })?;
    fs::write(path_ref, body).map_err(|source| ConfigError::Write {
        path: path_ref.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_path(file_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "{file_name}-{}.toml",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    #[test]
    fn empty_document_yields_defaults() {
        let settings = parse_settings("").expect("parse empty settings");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.boot_timeout_secs, 300);
        assert_eq!(settings.default_guest_username, "Administrator");
        assert_eq!(settings.result_root, PathBuf::from("results"));
        assert!(!settings.notification.notify_on_start);
        assert!(settings.notification.notify_on_complete);
        assert!(settings.notification.notify_on_failure);
        assert!(settings.notification.notify_on_error);
    }

    #[test]
    fn parse_settings_reads_vms_and_notification() {
        let settings = parse_settings(
            r#"
vmrun_path = "C:\\Program Files (x86)\\VMware\\VMware Workstation\\vmrun.exe"
result_root = "D:\\results"

[notification]
enabled = true
sink = "slack"
slack_webhook_url = "https://hooks.slack.com/services/T/B/X"
notify_on_start = true

[[registered_vms]]
name = "Win10"
vmx_path = "D:\\VMs\\Win10\\Win10.vmx"
guest_username = "tester"
guest_password = "secret"
"#,
        )
        .expect("parse settings");

        assert_eq!(settings.notification.sink, NotificationSinkKind::Slack);
        assert_eq!(
            settings.notification.target_url(),
            Some("https://hooks.slack.com/services/T/B/X")
        );
        assert!(settings.notification.notify_on_start);
        let vm = settings
            .find_vm(&VmRef::new("d:\\vms\\win10\\WIN10.vmx"))
            .expect("registered vm");
        assert_eq!(vm.name, "Win10");
        assert!(settings.find_vm_by_name("win10").is_some());
    }

    #[test]
    fn save_and_load_settings_roundtrip() {
        let mut settings = Settings::default();
        settings.install_dirs.push(PathBuf::from("/opt/vmware/bin"));
        settings.registered_vms.push(VmInfo {
            name: "Ubuntu".to_string(),
            vmx_path: VmRef::new("/vms/ubuntu.vmx"),
            guest_username: Some("qa".to_string()),
            guest_password: None,
        });

        let dir = std::env::temp_dir().join(format!(
            "vmregress-settings-test-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path = dir.join("config").join("vmregress.toml");
        save_settings(&path, &settings).expect("save settings");
        let loaded = load_settings(&path).expect("load settings");
        assert_eq!(loaded, settings);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_settings_classifies_read_and_parse_errors() {
        let missing_path = unique_temp_path("vmregress-missing-settings");
        let err = load_settings(&missing_path).expect_err("missing file should fail");
        assert!(matches!(err, ConfigError::Read { path, .. } if path == missing_path));
        let defaults = load_settings_or_default(&missing_path).expect("defaults for missing");
        assert_eq!(defaults, Settings::default());

        let invalid_path = unique_temp_path("vmregress-invalid-settings");
        fs::write(&invalid_path, "boot_timeout_secs = [").expect("write invalid fixture");
        let err = load_settings(&invalid_path).expect_err("invalid config should fail");
        assert!(matches!(err, ConfigError::Parse { path, .. } if path == invalid_path));
        let _ = fs::remove_file(invalid_path);
    }

    #[test]
    fn unregistered_vm_uses_file_stem() {
        let info = VmInfo::unregistered(&VmRef::new("D:\\VMs\\XP\\xp-sp3.vmx"));
        assert_eq!(info.name, "xp-sp3");
        assert!(info.guest_username.is_none());
    }
}
