pub mod client;
pub mod command;
pub mod control;
pub mod error;
pub mod memory;
pub mod types;

pub use client::*;
pub use command::*;
pub use control::*;
pub use error::*;
pub use memory::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::{
        guest_parent_dir, parse_inventory, parse_list_snapshots, resolve_vmrun_binary,
        GuestProcessOutput, GuestProgram, InMemoryVm, InventoryEntry, Snapshot, VmControl,
        VmError, VmrunCli, VmrunClient, VmrunCommand,
    };
    use std::any::TypeId;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    #[test]
    fn crate_root_reexports_types() {
        let _ = TypeId::of::<VmrunCli>();
        let _ = TypeId::of::<VmrunClient>();
        let _ = TypeId::of::<VmrunCommand>();
        let _ = TypeId::of::<VmError>();
        let _ = TypeId::of::<InMemoryVm>();
        let _ = TypeId::of::<Snapshot>();
        let _ = TypeId::of::<GuestProgram>();
        let _ = TypeId::of::<GuestProcessOutput>();
        let _ = TypeId::of::<InventoryEntry>();
    }

    #[test]
    fn crate_root_reexports_helpers_and_trait_objects() {
        let _parse: fn(&str) -> Vec<Snapshot> = parse_list_snapshots;
        let _inventory: fn(&str) -> Vec<InventoryEntry> = parse_inventory;
        let _resolve: fn(Option<&Path>, &[PathBuf]) -> Result<PathBuf, VmError> =
            resolve_vmrun_binary;
        assert_eq!(guest_parent_dir("C:\\a\\b.txt"), Some("C:\\a"));

        let controls: Vec<Arc<dyn VmControl>> = vec![
            Arc::new(InMemoryVm::connected()),
            Arc::new(VmrunClient::new(None, Vec::new())),
        ];
        assert!(controls[0].is_connected());
        assert!(!controls[1].is_connected());
    }
}
