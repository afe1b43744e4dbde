//! External command execution for the VirtualBox tools.
//!
//! ## Architecture
//!
//! ```text
//! VBoxCli<E: CommandExecutor>
//!     ├─► manage(args)    →  E::output("VBoxManage", args)   (run + wait)
//!     └─► headless(args)  →  E::spawn("VBoxHeadless", args)  (start, no wait)
//! ```
//!
//! [`SystemExecutor`] binds the trait to `tokio::process`; tests substitute a
//! recorder that never touches the host.

use std::future::Future;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::vm::VmError;

/// Runs external programs on behalf of the VM operations.
pub trait CommandExecutor: Send + Sync {
    /// Handle for a process started with [`CommandExecutor::spawn`].
    type Process: Send + 'static;

    /// Run `program` to completion and return its stdout.
    ///
    /// A nonzero exit becomes [`VmError::CommandFailed`] carrying the exact
    /// argument vector.
    fn output(
        &self,
        program: &str,
        args: &[String],
    ) -> impl Future<Output = Result<String, VmError>> + Send;

    /// Start `program` and return immediately without waiting for it.
    fn spawn(&self, program: &str, args: &[String]) -> Result<Self::Process, VmError>;
}

/// Production executor backed by `tokio::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    type Process = Child;

    async fn output(&self, program: &str, args: &[String]) -> Result<String, VmError> {
        debug!(program, ?args, "running command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| VmError::Invocation {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(program, ?args, code = ?output.status.code(), "command failed");
            return Err(VmError::CommandFailed {
                program: program.to_string(),
                args: args.to_vec(),
                code: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn(&self, program: &str, args: &[String]) -> Result<Child, VmError> {
        debug!(program, ?args, "spawning process");

        // The headless process must not compete with the console bridge for
        // our terminal.
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| VmError::Invocation {
                program: program.to_string(),
                source,
            })
    }
}

/// Names of the two VirtualBox programs, bound to an executor.
#[derive(Debug, Clone)]
pub struct VBoxCli<E> {
    executor: E,
    manage_program: String,
    headless_program: String,
}

impl<E: CommandExecutor> VBoxCli<E> {
    pub fn new(
        executor: E,
        manage_program: impl Into<String>,
        headless_program: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            manage_program: manage_program.into(),
            headless_program: headless_program.into(),
        }
    }

    /// Bind to the stock `VBoxManage` / `VBoxHeadless` names on `PATH`.
    pub fn with_default_programs(executor: E) -> Self {
        Self::new(executor, "VBoxManage", "VBoxHeadless")
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Run one management subcommand and wait for it.
    pub async fn manage<S: AsRef<str>>(&self, args: &[S]) -> Result<String, VmError> {
        let args = owned_args(args);
        self.executor.output(&self.manage_program, &args).await
    }

    /// Start the headless VM process without waiting for it.
    pub fn headless<S: AsRef<str>>(&self, args: &[S]) -> Result<E::Process, VmError> {
        let args = owned_args(args);
        self.executor.spawn(&self.headless_program, &args)
    }
}

fn owned_args<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    args.iter().map(|a| a.as_ref().to_string()).collect()
}

/// Recording executor for unit tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};

    use super::CommandExecutor;
    use crate::vm::VmError;

    /// Records every invocation as `[program, args...]` and answers from
    /// canned responses.
    #[derive(Clone, Default)]
    pub struct RecordingExecutor {
        pub calls: Arc<Mutex<Vec<Vec<String>>>>,
        pub list_output: String,
        /// Fail the first invocation whose joined argv contains this text.
        pub fail_when: Option<String>,
    }

    impl RecordingExecutor {
        pub fn with_vms(names: &[&str]) -> Self {
            let list_output = names
                .iter()
                .map(|n| format!("\"{n}\" {{00000000-0000-0000-0000-000000000000}}\n"))
                .collect();
            Self {
                list_output,
                ..Self::default()
            }
        }

        pub fn failing_on(mut self, needle: &str) -> Self {
            self.fail_when = Some(needle.to_string());
            self
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        /// Management subcommands only (argv[1]), in call order.
        pub fn subcommands(&self) -> Vec<String> {
            self.calls()
                .iter()
                .filter_map(|c| c.get(1).cloned())
                .collect()
        }

        fn record(&self, program: &str, args: &[String]) -> Result<(), VmError> {
            let mut argv = vec![program.to_string()];
            argv.extend(args.iter().cloned());
            let joined = argv.join(" ");
            self.calls.lock().unwrap().push(argv);

            match &self.fail_when {
                Some(needle) if joined.contains(needle.as_str()) => Err(VmError::CommandFailed {
                    program: program.to_string(),
                    args: args.to_vec(),
                    code: Some(1),
                    stderr: String::new(),
                }),
                _ => Ok(()),
            }
        }
    }

    impl CommandExecutor for RecordingExecutor {
        type Process = String;

        async fn output(&self, program: &str, args: &[String]) -> Result<String, VmError> {
            self.record(program, args)?;
            if args.first().map(String::as_str) == Some("list") {
                return Ok(self.list_output.clone());
            }
            Ok(String::new())
        }

        fn spawn(&self, program: &str, args: &[String]) -> Result<String, VmError> {
            self.record(program, args)?;
            Ok(format!("{program} {}", args.join(" ")))
        }
    }
}
