//! Spawn and signal node processes.

use crate::{Error, NodeId};
use std::{
    fs::{self, File},
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::Stdio,
    time::Duration,
};
use tokio::{
    net::TcpStream,
    process::{Child, Command},
    time::timeout,
};
use tracing::debug;

/// Placeholder in the command template replaced with the node's host.
pub const HOST_PLACEHOLDER: &str = "{host}";

/// Placeholder in the command template replaced with the node's port.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// How long to wait when checking whether a port is already bound.
const PORT_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// A running node process.
pub trait Process: Send + 'static {
    /// Returns true if the process has not exited.
    fn is_alive(&mut self) -> bool;

    /// Ask the process to shut down gracefully.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcibly kill the process.
    fn kill(&mut self) -> io::Result<()>;

    /// Resolves once the process has exited.
    fn exited(&mut self) -> impl Future<Output = ()> + Send;
}

/// Launches node processes bound to a fixed port.
pub trait Launcher: Send + Sync + 'static {
    /// Handle to a launched process.
    type Process: Process;

    /// Launch node `id` listening on `port`.
    ///
    /// Returns [Error::PortInUse] if `port` is already bound.
    fn launch(
        &self,
        id: NodeId,
        port: u16,
    ) -> impl Future<Output = Result<Self::Process, Error>> + Send;
}

/// Configuration for [CommandLauncher].
#[derive(Clone, Debug)]
pub struct Config {
    /// Host the node listens on
    pub host: Ipv4Addr,

    /// Program followed by its arguments, with [HOST_PLACEHOLDER] and [PORT_PLACEHOLDER]
    /// substituted per node
    pub command: Vec<String>,

    /// Working directory for node processes
    pub workdir: PathBuf,

    /// Directory receiving one `node_<id>.log` per node
    pub log_dir: PathBuf,
}

/// Launches nodes as child processes of the harness.
pub struct CommandLauncher {
    cfg: Config,
}

impl CommandLauncher {
    pub fn new(cfg: Config) -> Result<Self, Error> {
        if cfg.command.is_empty() {
            return Err(Error::InvalidConfig("node command is empty".into()));
        }
        fs::create_dir_all(&cfg.log_dir)?;
        Ok(Self { cfg })
    }

    /// Returns the command line for a node on `port`.
    pub fn command_line(&self, port: u16) -> Vec<String> {
        let host = self.cfg.host.to_string();
        let port = port.to_string();
        self.cfg
            .command
            .iter()
            .map(|arg| {
                arg.replace(HOST_PLACEHOLDER, &host)
                    .replace(PORT_PLACEHOLDER, &port)
            })
            .collect()
    }

    /// Returns true if something already accepts connections on `port`.
    async fn port_in_use(&self, port: u16) -> bool {
        let addr = SocketAddr::from((self.cfg.host, port));
        matches!(
            timeout(PORT_CHECK_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

impl Launcher for CommandLauncher {
    type Process = ChildProcess;

    async fn launch(&self, id: NodeId, port: u16) -> Result<ChildProcess, Error> {
        if self.port_in_use(port).await {
            return Err(Error::PortInUse(port));
        }

        let args = self.command_line(port);
        let log_path = self.cfg.log_dir.join(format!("node_{id}.log"));
        let stdout = File::create(&log_path)?;
        let stderr = stdout.try_clone()?;
        let child = Command::new(&args[0])
            .args(&args[1..])
            .current_dir(&self.cfg.workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProcessStart {
                node: id,
                reason: e.to_string(),
            })?;
        debug!(node = id, pid = ?child.id(), log = ?log_path, "spawned node process");
        Ok(ChildProcess { child })
    }
}

/// A node running as a child process.
pub struct ChildProcess {
    child: Child,
}

impl Process for ChildProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped
            return Ok(());
        };
        // SAFETY: `pid` belongs to a child we have not yet reaped, so it cannot have been
        // recycled for an unrelated process.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            result => result,
        }
    }

    async fn exited(&mut self) {
        let _ = self.child.wait().await;
    }
}
