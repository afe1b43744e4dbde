//! Application directory structure for vboxctl.
//!
//! Provides a single `AppPaths` struct that resolves all standard directories
//! and ensures they exist before first use:
//!
//! - Config:    `~/.config/vboxctl/`  (human-editable, XDG-style)
//! - Data:      `~/Library/Application Support/vboxctl/` on macOS,
//!   `$XDG_DATA_HOME/vboxctl/` elsewhere
//! - Instances: `<data>/instances/`  (one folder per VM)
//! - Logs:      `~/Library/Logs/vboxctl/` on macOS, `<data>/logs/` elsewhere

use std::path::{Path, PathBuf};
use tracing::info;

const APP_NAME: &str = "vboxctl";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config: `~/.config/vboxctl/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// Default base folder for VM files
    pub instances: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = home_dir()?;

        let config = resolve_config_dir(&home);
        let data = resolve_data_dir(&home);
        let logs = resolve_log_dir(&home, &data);

        Some(Self {
            config,
            instances: data.join("instances"),
            data,
            logs,
        })
    }

    /// `config.toml` inside the config directory.
    pub fn settings_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Create all directories that don't already exist.
    /// Excludes the VM instances folder from Time Machine on macOS.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.instances, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }

        #[cfg(target_os = "macos")]
        exclude_from_time_machine(&self.instances);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    let drive = std::env::var("HOMEDRIVE").ok()?;
    let path = std::env::var("HOMEPATH").ok()?;
    Some(PathBuf::from(format!("{drive}{path}")))
}

#[cfg(not(windows))]
fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Application Support").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path, _data: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(_home: &Path, data: &Path) -> PathBuf {
    data.join("logs")
}

// ---------------------------------------------------------------------------
// Time Machine exclusion (macOS only)
// ---------------------------------------------------------------------------

/// Cloned VM disks are large and regenerable.
#[cfg(target_os = "macos")]
fn exclude_from_time_machine(path: &Path) {
    use std::process::Command;
    use tracing::warn;
    match Command::new("tmutil")
        .args(["addexclusion", &path.to_string_lossy()])
        .output()
    {
        Ok(output) if output.status.success() => {
            info!("TM-excluded: {}", path.display());
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("tmutil addexclusion failed for {}: {}", path.display(), stderr.trim());
        }
        Err(e) => {
            warn!("failed to run tmutil for {}: {e}", path.display());
        }
    }
}
