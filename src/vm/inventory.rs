//! Live VM inventory from `VBoxManage list vms`.
//!
//! Nothing is cached: every query asks VirtualBox again.

use tracing::debug;

use crate::vm::VmError;
use crate::vm::executor::{CommandExecutor, VBoxCli};

/// Extract VM names from `list vms` output.
///
/// Each line looks like `"name" {uuid}`. The name runs from the first to the
/// last double quote on the line; lines without a quoted token are skipped.
pub fn parse_vm_list(output: &str) -> Vec<String> {
    output.lines().filter_map(quoted_token).collect()
}

fn quoted_token(line: &str) -> Option<String> {
    let start = line.find('"')?;
    let end = line.rfind('"')?;
    if end <= start {
        return None;
    }
    Some(line[start + 1..end].to_string())
}

impl<E: CommandExecutor> VBoxCli<E> {
    /// Names of every VM VirtualBox currently has registered.
    pub async fn list_vms(&self) -> Result<Vec<String>, VmError> {
        let output = self.manage(&["list", "vms"]).await?;
        let vms = parse_vm_list(&output);
        debug!(count = vms.len(), "listed registered VMs");
        Ok(vms)
    }

    pub async fn vm_exists(&self, name: &str) -> Result<bool, VmError> {
        Ok(self.list_vms().await?.iter().any(|vm| vm == name))
    }
}
