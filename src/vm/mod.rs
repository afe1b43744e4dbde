//! VirtualBox VM management for vboxctl.
//!
//! Provides the command executor seam, live inventory queries, NAT rule
//! translation, provisioning, the launch state machine, and the serial
//! console bridge for a single headless VM.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod console;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod lifecycle;
pub mod nat;
pub mod provisioning;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Identifies and sizes one VM instance.
///
/// Constructed by the caller and left untouched for the duration of a launch.
/// `name` doubles as a path component, see [`VmConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Unique name in the VirtualBox registry.
    pub name: String,

    /// Base folder; VM files live under `<directory>/<name>/`.
    pub directory: PathBuf,

    /// Disk image cloned into the VM's storage path.
    pub source_image: PathBuf,

    pub memory_mb: u64,

    pub cpu_count: u32,

    /// Port forwards, applied in order.
    #[serde(default)]
    pub nat_rules: Vec<NatRule>,
}

impl VmConfig {
    /// Folder holding this VM's files.
    pub fn vm_dir(&self) -> PathBuf {
        self.directory.join(&self.name)
    }

    /// Settings file `createvm` writes and `registervm` reads back.
    pub fn settings_path(&self) -> PathBuf {
        self.vm_dir().join(format!("{}.vbox", self.name))
    }

    /// Clone target for the source image.
    pub fn storage_path(&self, disk_extension: &str) -> PathBuf {
        self.vm_dir().join(format!("disk.{disk_extension}"))
    }

    /// Check the invariants the launch sequence relies on.
    ///
    /// The name must be non-empty and safe as a single path component since
    /// the disk, settings and socket paths are derived from it.
    pub fn validate(&self) -> Result<(), VmError> {
        if self.name.is_empty() {
            return Err(VmError::InvalidConfig("VM name is empty".into()));
        }
        if self.name == "." || self.name == ".." {
            return Err(VmError::InvalidConfig(format!(
                "VM name {:?} is not a valid directory name",
                self.name
            )));
        }
        if let Some(bad) = self
            .name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(VmError::InvalidConfig(format!(
                "VM name {:?} contains {bad:?}; use letters, digits, '-', '_' or '.'",
                self.name
            )));
        }
        if self.cpu_count == 0 {
            return Err(VmError::InvalidConfig("cpu_count must be at least 1".into()));
        }
        Ok(())
    }
}

/// Host-wide values that shape every VM this tool creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineDefaults {
    /// `--ostype` passed to `createvm`.
    pub os_type: String,
    /// Extension of the cloned disk, which also selects its format.
    pub disk_extension: String,
}

impl Default for MachineDefaults {
    fn default() -> Self {
        Self {
            os_type: "Linux26_64".to_string(),
            disk_extension: "vdi".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use console::{
    BridgeOutcome, ConsoleBridge, ConsoleConnector, LocalSocketConnector, RetryPolicy,
    SocketLayout,
};
pub use error::{ProvisionStep, VmError};
pub use executor::{CommandExecutor, SystemExecutor, VBoxCli};
pub use lifecycle::{LaunchOptions, LaunchState, LaunchedVm, Launcher};
pub use nat::NatRule;
