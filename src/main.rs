//! vboxctl: launch a headless VirtualBox VM and talk to its serial console.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vboxctl::config::Settings;
use vboxctl::logging;
use vboxctl::paths::AppPaths;
use vboxctl::vm::{
    LaunchOptions, Launcher, LocalSocketConnector, NatRule, SocketLayout, SystemExecutor,
    VBoxCli, VmConfig,
};

/// Headless VirtualBox launcher
#[derive(Parser, Debug)]
#[command(name = "vboxctl", version, about = "Launch a VM under VirtualBox with its console on this terminal")]
struct Args {
    /// Settings file (default: ~/.config/vboxctl/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a fresh VM from a disk image, start it, and attach the console
    Launch {
        /// VM name; an existing VM with this name is deleted first
        name: String,

        /// Disk image to clone
        #[arg(long)]
        image: PathBuf,

        /// Base folder for VM files
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Memory in MB
        #[arg(short, long)]
        memory: Option<u64>,

        /// Number of virtual CPUs
        #[arg(short, long)]
        cpus: Option<u32>,

        /// Forward a host port to a guest port (HOST:GUEST), repeatable
        #[arg(short = 'p', long = "forward")]
        forwards: Vec<NatRule>,

        /// Unregister and delete the VM if provisioning fails part way
        #[arg(long)]
        cleanup_on_failure: bool,
    },

    /// Power off a running VM
    Stop { name: String },

    /// Unregister a VM and delete its files
    Delete { name: String },

    /// List registered VMs
    List {
        /// Print a JSON array instead of one name per line
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let paths = AppPaths::resolve().context("cannot resolve home directory")?;
    let log_guard = logging::init(Some(&paths.logs));

    let settings_path = args.config.clone().unwrap_or_else(|| paths.settings_file());
    let settings = Settings::load(&settings_path)?;
    let instances_dir = settings
        .instances_dir
        .clone()
        .unwrap_or_else(|| paths.instances.clone());

    let cli = VBoxCli::new(
        SystemExecutor,
        settings.manage_program.clone(),
        settings.headless_program.clone(),
    );
    let launcher = Launcher::new(cli, LocalSocketConnector, SocketLayout::for_host())
        .with_defaults(settings.machine_defaults());

    match args.command {
        Command::Launch {
            name,
            image,
            dir,
            memory,
            cpus,
            forwards,
            cleanup_on_failure,
        } => {
            let directory = match dir {
                Some(dir) => dir,
                None => {
                    paths.ensure().context("create application directories")?;
                    instances_dir
                }
            };
            let config = VmConfig {
                name,
                directory,
                source_image: image,
                memory_mb: memory.unwrap_or(settings.memory_mb),
                cpu_count: cpus.unwrap_or(settings.cpu_count),
                nat_rules: forwards,
            };
            let launcher = launcher.with_options(LaunchOptions {
                cleanup_on_failure,
                retry: settings.retry_policy(),
            });

            let mut vm = launcher
                .launch_vm(&config)
                .await
                .with_context(|| format!("launch VM {}", config.name))?;

            let status = vm.process.wait().await.context("wait for VBoxHeadless")?;
            info!(vm = %config.name, ?status, "VM process exited");
            let outcome = vm.console.shutdown().await;
            if let Err(e) = outcome.from_console {
                warn!(error = %e, "console output ended with an error");
            }

            // stdin is read on a blocking thread that cannot be cancelled, so
            // a normal runtime shutdown could hang until the user hits enter.
            drop(log_guard);
            std::process::exit(status.code().unwrap_or(1));
        }
        Command::Stop { name } => {
            launcher
                .stop_vm(&name)
                .await
                .with_context(|| format!("stop VM {name}"))?;
        }
        Command::Delete { name } => {
            let config = VmConfig {
                name,
                directory: instances_dir,
                source_image: PathBuf::new(),
                memory_mb: settings.memory_mb,
                cpu_count: settings.cpu_count,
                nat_rules: Vec::new(),
            };
            launcher
                .delete_vm(&config)
                .await
                .with_context(|| format!("delete VM {}", config.name))?;
        }
        Command::List { json } => {
            let vms = launcher.cli().list_vms().await.context("list VMs")?;
            if json {
                println!("{}", serde_json::to_string(&vms)?);
            } else {
                for vm in vms {
                    println!("{vm}");
                }
            }
        }
    }

    Ok(())
}
