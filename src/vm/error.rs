//! Error type shared by every VM operation.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// One stage of the provisioning sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    CreateVm,
    RegisterVm,
    CloneDisk,
    StorageController,
    AttachDisk,
    NetworkAdapter,
    NatRules,
    Timer,
    SerialPort,
    Memory,
    Cpus,
}

impl ProvisionStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateVm => "create vm",
            Self::RegisterVm => "register vm",
            Self::CloneDisk => "clone disk",
            Self::StorageController => "storage controller",
            Self::AttachDisk => "attach disk",
            Self::NetworkAdapter => "network adapter",
            Self::NatRules => "nat rules",
            Self::Timer => "hpet timer",
            Self::SerialPort => "serial port",
            Self::Memory => "memory",
            Self::Cpus => "cpus",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    /// The external program could not be started at all.
    #[error("failed to invoke `{program}`: {source}")]
    Invocation {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The external program ran but exited nonzero.
    #[error("{program} {args:?} failed (exit {}){}", exit_label(.code), stderr_suffix(.stderr))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        code: Option<i32>,
        stderr: String,
    },

    #[error("provisioning step `{step}` failed: {source}")]
    Provision {
        step: ProvisionStep,
        #[source]
        source: Box<VmError>,
    },

    #[error("console socket {} unreachable after {attempts} attempts: {source}", .path.display())]
    ConnectionTimeout {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid VM config: {0}")]
    InvalidConfig(String),
}

impl VmError {
    /// The provisioning step this error came from, if any.
    pub fn provision_step(&self) -> Option<ProvisionStep> {
        match self {
            Self::Provision { step, .. } => Some(*step),
            _ => None,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}
