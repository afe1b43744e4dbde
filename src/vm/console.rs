//! Serial console access: socket location, bounded-retry connect, and the
//! bidirectional bridge to the terminal.
//!
//! ## Architecture
//!
//! ```text
//! SocketLayout::socket_path(config)      (chosen once per host)
//!     └─► connect_with_retry(connector, path, RetryPolicy)
//!             └─► ConsoleBridge::start(stream, stdin, stdout)
//!                     ├─► to_console task    (stdin  → socket)
//!                     └─► from_console task  (socket → stdout)
//! ```
//!
//! Both tasks stop on EOF, on an I/O error, or when the bridge is shut down.
//! Dropping the [`ConsoleBridge`] also stops them.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::vm::{VmConfig, VmError};

// ---------------------------------------------------------------------------
// Socket location
// ---------------------------------------------------------------------------

/// Where VirtualBox exposes the VM's redirected serial port.
///
/// The same value must drive both the `--uartmode1 server <path>` argument at
/// provisioning time and the later connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketLayout {
    /// `\\.\pipe\<name>`
    NamedPipe,
    /// `<directory>/<name>/<name>.sock`
    UnixSocket,
}

impl SocketLayout {
    /// Layout for the platform this binary was built for.
    pub fn for_host() -> Self {
        if cfg!(windows) {
            Self::NamedPipe
        } else {
            Self::UnixSocket
        }
    }

    pub fn socket_path(self, config: &VmConfig) -> PathBuf {
        match self {
            Self::NamedPipe => PathBuf::from(format!(r"\\.\pipe\{}", config.name)),
            Self::UnixSocket => config.vm_dir().join(format!("{}.sock", config.name)),
        }
    }
}

// ---------------------------------------------------------------------------
// Connecting
// ---------------------------------------------------------------------------

/// Opens a stream to the console socket.
pub trait ConsoleConnector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, path: &Path) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Unix domain socket client, or named pipe client on Windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSocketConnector;

#[cfg(unix)]
impl ConsoleConnector for LocalSocketConnector {
    type Stream = tokio::net::UnixStream;

    async fn connect(&self, path: &Path) -> io::Result<Self::Stream> {
        tokio::net::UnixStream::connect(path).await
    }
}

#[cfg(windows)]
impl ConsoleConnector for LocalSocketConnector {
    type Stream = tokio::net::windows::named_pipe::NamedPipeClient;

    async fn connect(&self, path: &Path) -> io::Result<Self::Stream> {
        tokio::net::windows::named_pipe::ClientOptions::new().open(path)
    }
}

/// Fixed-delay retry budget for reaching the console socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Pause between consecutive attempts; none after the last.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

/// Connect to `path`, retrying on any I/O error within `policy`.
///
/// Returns [`VmError::ConnectionTimeout`] carrying the last error once every
/// attempt has failed. A zero-attempt policy still tries once.
pub async fn connect_with_retry<C: ConsoleConnector>(
    connector: &C,
    path: &Path,
    policy: RetryPolicy,
) -> Result<C::Stream, VmError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match connector.connect(path).await {
            Ok(stream) => {
                info!(path = %path.display(), attempt, "console connected");
                return Ok(stream);
            }
            Err(e) if attempt < attempts => {
                debug!(path = %path.display(), attempt, error = %e, "console not ready");
            }
            Err(e) => {
                warn!(path = %path.display(), attempts, error = %e, "console unreachable");
                return Err(VmError::ConnectionTimeout {
                    path: path.to_path_buf(),
                    attempts,
                    source: e,
                });
            }
        }

        tokio::time::sleep(policy.delay).await;
        attempt += 1;
    }
}

// ---------------------------------------------------------------------------
// Bridging
// ---------------------------------------------------------------------------

/// Bytes copied by each direction, or the error that stopped it.
#[derive(Debug)]
pub struct BridgeOutcome {
    /// Terminal input written to the console socket.
    pub to_console: io::Result<u64>,
    /// Console output written to the terminal.
    pub from_console: io::Result<u64>,
}

/// Owner of the two copy tasks wired between a console socket and the
/// terminal.
pub struct ConsoleBridge {
    shutdown: watch::Sender<bool>,
    to_console: JoinHandle<io::Result<u64>>,
    from_console: JoinHandle<io::Result<u64>>,
}

impl ConsoleBridge {
    /// Spawn both copy directions. Must be called inside a Tokio runtime.
    pub fn start<S, R, W>(stream: S, input: R, output: W) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (socket_rd, socket_wr) = tokio::io::split(stream);
        let (shutdown, stop_rx) = watch::channel(false);

        let to_console = tokio::spawn(pump(input, socket_wr, stop_rx.clone(), "to_console"));
        let from_console = tokio::spawn(pump(socket_rd, output, stop_rx, "from_console"));

        Self {
            shutdown,
            to_console,
            from_console,
        }
    }

    /// `true` once both directions have stopped.
    pub fn is_finished(&self) -> bool {
        self.to_console.is_finished() && self.from_console.is_finished()
    }

    /// Wait for both directions to end on their own.
    pub async fn join(self) -> BridgeOutcome {
        let Self {
            shutdown,
            to_console,
            from_console,
        } = self;
        let (to_console, from_console) = tokio::join!(to_console, from_console);
        drop(shutdown);

        BridgeOutcome {
            to_console: flatten(to_console),
            from_console: flatten(from_console),
        }
    }

    /// Signal both directions to stop, then wait for them.
    pub async fn shutdown(self) -> BridgeOutcome {
        let _ = self.shutdown.send(true);
        self.join().await
    }
}

fn flatten(joined: Result<io::Result<u64>, tokio::task::JoinError>) -> io::Result<u64> {
    joined.unwrap_or_else(|e| Err(io::Error::other(e)))
}

/// Copy `reader` into `writer` until EOF, error, or stop signal.
///
/// A dropped stop sender counts as a stop.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    mut stop: watch::Receiver<bool>,
    direction: &'static str,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    let mut total: u64 = 0;

    loop {
        let n = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => {
                debug!(direction, total, "console bridge stopped");
                break;
            }
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            debug!(direction, total, "console bridge reached EOF");
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }

    Ok(total)
}
