//! VM provisioning through `VBoxManage`.
//!
//! [`ProvisionPlan::new`] turns a [`VmConfig`] into the ordered list of
//! management commands; [`provision`] runs them fail-fast. Building the plan
//! is pure so the exact argument vectors can be inspected without VirtualBox.
//!
//! Nothing is rolled back on failure: the VM stays registered and partially
//! configured so it can be inspected with `VBoxManage showvminfo`. Callers
//! that prefer a clean slate use [`provision_or_cleanup`].

use tracing::{info, warn};

use crate::vm::console::SocketLayout;
use crate::vm::executor::{CommandExecutor, VBoxCli};
use crate::vm::nat::natpf_rule;
use crate::vm::{MachineDefaults, ProvisionStep, VmConfig, VmError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Name of the storage controller the cloned disk hangs off.
const STORAGE_CONTROLLER: &str = "SATA";

/// First serial port: I/O base and IRQ of a PC's COM1.
const UART1_IO_BASE: &str = "0x3f8";
const UART1_IRQ: &str = "4";

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One management command and the step it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    pub step: ProvisionStep,
    pub args: Vec<String>,
}

/// Ordered management commands that create and configure one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionPlan {
    commands: Vec<PlannedCommand>,
}

impl ProvisionPlan {
    /// Steps, in order:
    ///
    /// 1. `createvm` under `<directory>`.
    /// 2. `registervm` the generated `.vbox` file.
    /// 3. `clonehd` the source image to `<directory>/<name>/disk.<ext>`.
    /// 4. `storagectl` adds a SATA controller.
    /// 5. `storageattach` the clone on port 0.
    /// 6. NIC 1 in NAT mode with a virtio adapter.
    /// 7. One `--natpf1` per NAT rule, in config order.
    /// 8. HPET on.
    /// 9. UART 1 as a server socket at the console path.
    /// 10. Memory.
    /// 11. CPU count.
    ///
    /// The disk must exist before it is attached and the NIC must be in NAT
    /// mode before rules target it.
    pub fn new(config: &VmConfig, layout: SocketLayout, defaults: &MachineDefaults) -> Self {
        let name = config.name.as_str();
        let disk = path_arg(&config.storage_path(&defaults.disk_extension));
        let socket = path_arg(&layout.socket_path(config));

        let mut plan = Self { commands: Vec::new() };

        plan.push(
            ProvisionStep::CreateVm,
            &[
                "createvm",
                "--name",
                name,
                "--basefolder",
                &path_arg(&config.directory),
                "--ostype",
                &defaults.os_type,
            ],
        );
        plan.push(
            ProvisionStep::RegisterVm,
            &["registervm", &path_arg(&config.settings_path())],
        );
        plan.push(
            ProvisionStep::CloneDisk,
            &["clonehd", &path_arg(&config.source_image), &disk],
        );
        plan.push(
            ProvisionStep::StorageController,
            &[
                "storagectl",
                name,
                "--name",
                STORAGE_CONTROLLER,
                "--add",
                "sata",
                "--controller",
                "IntelAHCI",
            ],
        );
        plan.push(
            ProvisionStep::AttachDisk,
            &[
                "storageattach",
                name,
                "--storagectl",
                STORAGE_CONTROLLER,
                "--port",
                "0",
                "--type",
                "hdd",
                "--medium",
                &disk,
            ],
        );
        plan.push(
            ProvisionStep::NetworkAdapter,
            &["modifyvm", name, "--nic1", "nat", "--nictype1", "virtio"],
        );
        for (index, rule) in config.nat_rules.iter().enumerate() {
            plan.push(
                ProvisionStep::NatRules,
                &["modifyvm", name, "--natpf1", &natpf_rule(rule, index)],
            );
        }
        plan.push(ProvisionStep::Timer, &["modifyvm", name, "--hpet", "on"]);
        plan.push(
            ProvisionStep::SerialPort,
            &[
                "modifyvm",
                name,
                "--uart1",
                UART1_IO_BASE,
                UART1_IRQ,
                "--uartmode1",
                "server",
                &socket,
            ],
        );
        plan.push(
            ProvisionStep::Memory,
            &["modifyvm", name, "--memory", &config.memory_mb.to_string()],
        );
        plan.push(
            ProvisionStep::Cpus,
            &["modifyvm", name, "--cpus", &config.cpu_count.to_string()],
        );

        plan
    }

    pub fn commands(&self) -> &[PlannedCommand] {
        &self.commands
    }

    fn push(&mut self, step: ProvisionStep, args: &[&str]) {
        self.commands.push(PlannedCommand {
            step,
            args: args.iter().map(|a| a.to_string()).collect(),
        });
    }
}

fn path_arg(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Run every command in `plan`, stopping at the first failure.
///
/// # Errors
///
/// [`VmError::Provision`] naming the failing step, wrapping the executor
/// error. Later steps never run.
pub async fn provision<E: CommandExecutor>(
    cli: &VBoxCli<E>,
    name: &str,
    plan: &ProvisionPlan,
) -> Result<(), VmError> {
    for command in plan.commands() {
        if let Err(source) = cli.manage(&command.args).await {
            warn!(vm = name, step = %command.step, error = %source, "provisioning failed");
            return Err(VmError::Provision {
                step: command.step,
                source: Box::new(source),
            });
        }
    }

    info!(vm = name, commands = plan.commands().len(), "VM provisioned");
    Ok(())
}

/// [`provision`], then on failure try `unregistervm --delete` before
/// returning the original error. A failed cleanup is only logged.
pub async fn provision_or_cleanup<E: CommandExecutor>(
    cli: &VBoxCli<E>,
    name: &str,
    plan: &ProvisionPlan,
) -> Result<(), VmError> {
    let Err(err) = provision(cli, name, plan).await else {
        return Ok(());
    };

    // createvm itself failed, so there is nothing registered to remove.
    if err.provision_step() != Some(ProvisionStep::CreateVm) {
        match cli.manage(&["unregistervm", name, "--delete"]).await {
            Ok(_) => info!(vm = name, "removed partially provisioned VM"),
            Err(e) => warn!(vm = name, error = %e, "cleanup after failed provisioning failed"),
        }
    }

    Err(err)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
