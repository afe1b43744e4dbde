//! VM launch lifecycle: stale-VM removal, provisioning, headless start and
//! console bridging.
//!
//! ## Architecture
//!
//! ```text
//! Launcher::launch_vm(VmConfig)
//!     ├─► vm_exists?  ──yes──► unregistervm --delete          Absent
//!     ├─► provision(ProvisionPlan)                           Provisioned
//!     ├─► VBoxHeadless --startvm <name>   (not awaited)      Running
//!     └─► connect_with_retry(socket)  →  ConsoleBridge        Bridged
//!             └─► LaunchedVm { process, console }
//! ```
//!
//! Every step is fail-fast. A console timeout leaves the headless process
//! running; the caller decides whether to stop it.
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::vm::console::{
    ConsoleBridge, ConsoleConnector, RetryPolicy, SocketLayout, connect_with_retry,
};
use crate::vm::executor::{CommandExecutor, VBoxCli};
use crate::vm::provisioning::{ProvisionPlan, provision, provision_or_cleanup};
use crate::vm::{MachineDefaults, VmConfig, VmError};

/// Where a launch currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// No VM with the target name is registered.
    Absent,
    /// Created and configured, not started.
    Provisioned,
    /// Headless process started.
    Running,
    /// Console socket connected and copy tasks running.
    Bridged,
}

/// Knobs for a launch that are not part of the VM itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchOptions {
    /// Unregister and delete the VM when provisioning fails part way.
    pub cleanup_on_failure: bool,
    pub retry: RetryPolicy,
}

/// A started VM and its console bridge.
///
/// Dropping this value does NOT stop the VM process. Dropping `console`
/// stops the bridge tasks.
pub struct LaunchedVm<P> {
    pub process: P,
    pub console: ConsoleBridge,
    pub socket_path: PathBuf,
}

/// Drives VirtualBox through the launch sequence for one VM at a time.
pub struct Launcher<E, C> {
    cli: VBoxCli<E>,
    connector: C,
    layout: SocketLayout,
    defaults: MachineDefaults,
    options: LaunchOptions,
}

impl<E: CommandExecutor, C: ConsoleConnector> Launcher<E, C> {
    pub fn new(cli: VBoxCli<E>, connector: C, layout: SocketLayout) -> Self {
        Self {
            cli,
            connector,
            layout,
            defaults: MachineDefaults::default(),
            options: LaunchOptions::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: MachineDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_options(mut self, options: LaunchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn cli(&self) -> &VBoxCli<E> {
        &self.cli
    }

    /// Launch `config` and bridge its console to this process's stdin/stdout.
    pub async fn launch_vm(&self, config: &VmConfig) -> Result<LaunchedVm<E::Process>, VmError> {
        self.launch_vm_with_io(config, tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Launch `config` and bridge its console to `input` / `output`.
    ///
    /// Any VM already registered under the same name is deleted first,
    /// without confirmation.
    pub async fn launch_vm_with_io<R, W>(
        &self,
        config: &VmConfig,
        input: R,
        output: W,
    ) -> Result<LaunchedVm<E::Process>, VmError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let name = config.name.as_str();

        if self.cli.vm_exists(name).await? {
            info!(vm = name, "removing stale VM with the same name");
            self.delete_vm(config).await?;
        }
        let mut state = LaunchState::Absent;

        let plan = ProvisionPlan::new(config, self.layout, &self.defaults);
        if self.options.cleanup_on_failure {
            provision_or_cleanup(&self.cli, name, &plan).await?;
        } else {
            provision(&self.cli, name, &plan).await?;
        }
        state = advance(name, state, LaunchState::Provisioned);

        let process = self.cli.headless(&["--startvm", name])?;
        state = advance(name, state, LaunchState::Running);

        let socket_path = self.layout.socket_path(config);
        let stream = match connect_with_retry(&self.connector, &socket_path, self.options.retry).await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(vm = name, "console unreachable; VM process left running");
                return Err(e);
            }
        };

        let console = ConsoleBridge::start(stream, input, output);
        advance(name, state, LaunchState::Bridged);

        Ok(LaunchedVm {
            process,
            console,
            socket_path,
        })
    }

    /// Unregister the VM and delete its files.
    pub async fn delete_vm(&self, config: &VmConfig) -> Result<(), VmError> {
        self.cli
            .manage(&["unregistervm", config.name.as_str(), "--delete"])
            .await?;
        info!(vm = %config.name, "VM deleted");
        Ok(())
    }

    /// Hard power-off; the guest gets no chance to shut down.
    pub async fn stop_vm(&self, name: &str) -> Result<(), VmError> {
        self.cli.manage(&["controlvm", name, "poweroff"]).await?;
        info!(vm = name, "VM powered off");
        Ok(())
    }
}

fn advance(name: &str, from: LaunchState, to: LaunchState) -> LaunchState {
    debug!(vm = name, ?from, ?to, "launch state");
    to
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    use super::*;
    use crate::vm::executor::fake::RecordingExecutor;
    use crate::vm::{NatRule, ProvisionStep};

    /// Fails `failures` times, then hands out the VM end of a duplex pair.
    struct FakeConsole {
        failures: u32,
        attempts: AtomicU32,
        paths: Mutex<Vec<PathBuf>>,
        vm_side: Mutex<Option<DuplexStream>>,
    }

    impl FakeConsole {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                attempts: AtomicU32::new(0),
                paths: Mutex::new(Vec::new()),
                vm_side: Mutex::new(None),
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl ConsoleConnector for FakeConsole {
        type Stream = DuplexStream;

        async fn connect(&self, path: &Path) -> io::Result<DuplexStream> {
            self.paths.lock().unwrap().push(path.to_path_buf());
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            let (ours, theirs) = duplex(256);
            *self.vm_side.lock().unwrap() = Some(theirs);
            Ok(ours)
        }
    }

    fn config() -> VmConfig {
        VmConfig {
            name: "web".into(),
            directory: PathBuf::from("/vms"),
            source_image: PathBuf::from("/images/base.vdi"),
            memory_mb: 512,
            cpu_count: 1,
            nat_rules: vec![NatRule::new("80", "8080")],
        }
    }

    fn launcher(exec: RecordingExecutor, console: FakeConsole) -> Launcher<RecordingExecutor, FakeConsole> {
        Launcher::new(
            VBoxCli::with_default_programs(exec),
            console,
            SocketLayout::UnixSocket,
        )
    }

    async fn launch(
        l: &Launcher<RecordingExecutor, FakeConsole>,
    ) -> Result<LaunchedVm<String>, VmError> {
        let (_, input) = duplex(16);
        let (output, _) = duplex(16);
        l.launch_vm_with_io(&config(), input, output).await
    }

    const PROVISION_SEQUENCE: [&str; 11] = [
        "createvm",
        "registervm",
        "clonehd",
        "storagectl",
        "storageattach",
        "modifyvm", // nic
        "modifyvm", // natpf1
        "modifyvm", // hpet
        "modifyvm", // uart
        "modifyvm", // memory
        "modifyvm", // cpus
    ];

    #[tokio::test]
    async fn absent_vm_is_provisioned_without_delete() {
        let l = launcher(RecordingExecutor::with_vms(&["other"]), FakeConsole::new(0));

        let vm = launch(&l).await.unwrap();

        let mut expected = vec!["list".to_string()];
        expected.extend(PROVISION_SEQUENCE.iter().map(|s| s.to_string()));
        expected.push("--startvm".to_string());
        assert_eq!(l.cli().executor().subcommands(), expected);
        assert_eq!(vm.process, "VBoxHeadless --startvm web");
        assert_eq!(vm.socket_path, PathBuf::from("/vms/web/web.sock"));
    }

    #[tokio::test]
    async fn present_vm_is_deleted_before_provisioning() {
        let l = launcher(RecordingExecutor::with_vms(&["web"]), FakeConsole::new(0));

        launch(&l).await.unwrap();

        let calls = l.cli().executor().calls();
        assert_eq!(calls[1], vec!["VBoxManage", "unregistervm", "web", "--delete"]);
        assert_eq!(calls[2][1], "createvm");
    }

    #[tokio::test]
    async fn console_path_matches_serial_redirect() {
        let l = launcher(RecordingExecutor::default(), FakeConsole::new(0));

        launch(&l).await.unwrap();

        let calls = l.cli().executor().calls();
        let uart = calls
            .iter()
            .find(|c| c.contains(&"--uartmode1".to_string()))
            .unwrap();
        let connected = l.connector.paths.lock().unwrap()[0].clone();
        assert_eq!(PathBuf::from(uart.last().unwrap()), connected);
    }

    #[tokio::test(start_paused = true)]
    async fn late_console_is_reached_within_budget() {
        let l = launcher(RecordingExecutor::default(), FakeConsole::new(2));

        launch(&l).await.unwrap();

        assert_eq!(l.connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_console_fails_after_five_attempts_and_leaves_vm_running() {
        let l = launcher(RecordingExecutor::default(), FakeConsole::new(u32::MAX));
        let started = tokio::time::Instant::now();

        let err = launch(&l).await.err().unwrap();

        assert!(matches!(err, VmError::ConnectionTimeout { attempts: 5, .. }));
        assert_eq!(l.connector.attempts(), 5);
        assert!(started.elapsed() >= Duration::from_secs(2));
        let subcommands = l.cli().executor().subcommands();
        assert_eq!(subcommands.last().unwrap(), "--startvm");
        assert!(!subcommands.contains(&"controlvm".to_string()));
    }

    #[tokio::test]
    async fn provisioning_failure_aborts_before_start() {
        let l = launcher(
            RecordingExecutor::default().failing_on("--natpf1"),
            FakeConsole::new(0),
        );

        let err = launch(&l).await.err().unwrap();

        assert_eq!(err.provision_step(), Some(ProvisionStep::NatRules));
        assert!(!l.cli().executor().subcommands().contains(&"--startvm".to_string()));
        assert_eq!(l.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn cleanup_option_removes_partial_vm() {
        let l = launcher(
            RecordingExecutor::default().failing_on("--memory"),
            FakeConsole::new(0),
        )
        .with_options(LaunchOptions {
            cleanup_on_failure: true,
            ..LaunchOptions::default()
        });

        let err = launch(&l).await.err().unwrap();

        assert_eq!(err.provision_step(), Some(ProvisionStep::Memory));
        assert_eq!(l.cli().executor().subcommands().last().unwrap(), "unregistervm");
    }

    #[tokio::test]
    async fn invalid_name_runs_no_commands() {
        let l = launcher(RecordingExecutor::default(), FakeConsole::new(0));
        let mut cfg = config();
        cfg.name = "../escape".into();

        let (_, input) = duplex(16);
        let (output, _) = duplex(16);
        let err = l.launch_vm_with_io(&cfg, input, output).await.err().unwrap();

        assert!(matches!(err, VmError::InvalidConfig(_)));
        assert!(l.cli().executor().calls().is_empty());
    }

    #[tokio::test]
    async fn bridge_carries_console_traffic() {
        let l = launcher(RecordingExecutor::default(), FakeConsole::new(0));
        let (mut term_in, input) = duplex(64);
        let (output, mut term_out) = duplex(64);

        let vm = l.launch_vm_with_io(&config(), input, output).await.unwrap();
        let mut guest = l.connector.vm_side.lock().unwrap().take().unwrap();

        guest.write_all(b"login: ").await.unwrap();
        let mut banner = [0u8; 7];
        term_out.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"login: ");

        term_in.write_all(b"root\n").await.unwrap();
        let mut typed = [0u8; 5];
        guest.read_exact(&mut typed).await.unwrap();
        assert_eq!(&typed, b"root\n");

        let outcome = vm.console.shutdown().await;
        assert_eq!(outcome.to_console.unwrap(), 5);
        assert_eq!(outcome.from_console.unwrap(), 7);
    }

    #[tokio::test]
    async fn stop_and_delete_are_single_commands() {
        let l = launcher(RecordingExecutor::default(), FakeConsole::new(0));

        l.stop_vm("web").await.unwrap();
        l.delete_vm(&config()).await.unwrap();

        assert_eq!(
            l.cli().executor().calls(),
            vec![
                vec!["VBoxManage", "controlvm", "web", "poweroff"],
                vec!["VBoxManage", "unregistervm", "web", "--delete"],
            ]
        );
    }

    #[tokio::test]
    async fn stop_failure_is_reported_verbatim() {
        let l = launcher(
            RecordingExecutor::default().failing_on("poweroff"),
            FakeConsole::new(0),
        );

        let err = l.stop_vm("web").await.unwrap_err();

        match err {
            VmError::CommandFailed { args, .. } => {
                assert_eq!(args, vec!["controlvm", "web", "poweroff"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
