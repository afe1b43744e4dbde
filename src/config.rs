//! User settings loaded from `config.toml`.
//!
//! Every field is optional; a missing file means all defaults.
//!
//! ```toml
//! manage_program = "/usr/local/bin/VBoxManage"
//! memory_mb = 2048
//!
//! [console]
//! attempts = 10
//! retry_delay_ms = 250
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::vm::{MachineDefaults, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `VBoxManage` binary, looked up on `PATH` unless absolute.
    pub manage_program: String,
    /// `VBoxHeadless` binary.
    pub headless_program: String,
    pub os_type: String,
    pub disk_extension: String,
    /// Base folder for VM files; defaults to the app's instances directory.
    pub instances_dir: Option<PathBuf>,
    pub memory_mb: u64,
    pub cpu_count: u32,
    pub console: ConsoleSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    pub attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let machine = MachineDefaults::default();
        Self {
            manage_program: "VBoxManage".to_string(),
            headless_program: "VBoxHeadless".to_string(),
            os_type: machine.os_type,
            disk_extension: machine.disk_extension,
            instances_dir: None,
            memory_mb: 1024,
            cpu_count: 2,
            console: ConsoleSettings::default(),
        }
    }
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            attempts: retry.attempts,
            retry_delay_ms: retry.delay.as_millis() as u64,
        }
    }
}

impl Settings {
    /// Read settings from `path`, falling back to defaults if it is absent.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("parse settings {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read settings {}", path.display())),
        }
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn machine_defaults(&self) -> MachineDefaults {
        MachineDefaults {
            os_type: self.os_type.clone(),
            disk_extension: self.disk_extension.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.console.attempts,
            delay: Duration::from_millis(self.console.retry_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
