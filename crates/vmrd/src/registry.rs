use vmr_core::config::{Settings, VmInfo, DEFAULT_GUEST_USERNAME};
use vmr_core::types::VmRef;

/// Registered VMs plus the fallback guest account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRegistry {
    vms: Vec<VmInfo>,
    default_username: String,
}

impl Default for VmRegistry {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_GUEST_USERNAME)
    }
}

impl VmRegistry {
    pub fn new(vms: Vec<VmInfo>, default_username: impl Into<String>) -> Self {
        let default_username = default_username.into();
        let default_username = if default_username.trim().is_empty() {
            DEFAULT_GUEST_USERNAME.to_string()
        } else {
            default_username
        };
        Self {
            vms,
            default_username,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.registered_vms.clone(),
            settings.default_guest_username.clone(),
        )
    }

    pub fn vms(&self) -> &[VmInfo] {
        &self.vms
    }

    /// Registered entry for `vm`, or an unregistered one named after the vmx file.
    pub fn resolve(&self, vm: &VmRef) -> VmInfo {
        self.vms
            .iter()
            .find(|info| info.vmx_path.as_str().eq_ignore_ascii_case(vm.as_str()))
            .cloned()
            .unwrap_or_else(|| VmInfo::unregistered(vm))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&VmInfo> {
        self.vms
            .iter()
            .find(|info| info.name.eq_ignore_ascii_case(name))
    }

    /// Guest username and password, with an empty password when unset.
    pub fn credentials(&self, info: &VmInfo) -> (String, String) {
        let username = info
            .guest_username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.default_username)
            .to_string();
        let password = info.guest_password.clone().unwrap_or_default();
        (username, password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered() -> VmInfo {
        VmInfo {
            name: "Win10 x64".to_string(),
            vmx_path: VmRef::new("D:\\VMs\\Win10\\Win10.vmx"),
            guest_username: Some("tester".to_string()),
            guest_password: Some("secret".to_string()),
        }
    }

    #[test]
    fn resolve_prefers_registered_entry_case_insensitively() {
        let registry = VmRegistry::new(vec![registered()], "Administrator");
        let info = registry.resolve(&VmRef::new("d:\\vms\\win10\\WIN10.vmx"));
        assert_eq!(info.name, "Win10 x64");
        assert_eq!(
            registry.credentials(&info),
            ("tester".to_string(), "secret".to_string())
        );
    }

    #[test]
    fn unregistered_vm_uses_file_stem_and_default_account() {
        let registry = VmRegistry::default();
        let info = registry.resolve(&VmRef::new("D:\\VMs\\Server\\Server2019.vmx"));
        assert_eq!(info.name, "Server2019");
        assert_eq!(
            registry.credentials(&info),
            ("Administrator".to_string(), String::new())
        );
    }

    #[test]
    fn blank_default_username_falls_back() {
        let registry = VmRegistry::new(Vec::new(), "  ");
        let info = registry.resolve(&VmRef::new("a.vmx"));
        assert_eq!(registry.credentials(&info).0, DEFAULT_GUEST_USERNAME);
        assert!(registry.find_by_name("missing").is_none());
    }
}
