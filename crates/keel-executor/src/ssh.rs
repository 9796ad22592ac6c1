//! Remote adapter backed by the system OpenSSH client
//!
//! Every connection multiplexes over one `ControlMaster` socket, so commands
//! and tunnels after the first reuse the authenticated channel. Tunnels use
//! `ssh -W host:port`, which forwards stdio to a TCP connection opened by the
//! remote sshd.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_cluster::HostConfig;
use keel_common::{Error, Result};

use crate::executor::{drive, Adapter, AsyncStream, Connection, Executor, StreamIo, Tunneler};

/// Exit code ssh uses for its own (transport) failures
const SSH_TRANSPORT_EXIT: i32 = 255;

/// How long the control master outlives the last session
const CONTROL_PERSIST: &str = "5m";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens [`SshConnection`]s through the `ssh` binary
#[derive(Debug, Clone)]
pub struct OpenSshAdapter {
    control_dir: PathBuf,
    connect_timeout: Duration,
}

impl OpenSshAdapter {
    /// Control sockets are created under `control_dir`
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        Self {
            control_dir: control_dir.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Adapter for OpenSshAdapter {
    async fn open(&self, host: &HostConfig) -> Result<Arc<dyn Connection>> {
        tokio::fs::create_dir_all(&self.control_dir).await?;
        let conn = SshConnection::new(host, &self.control_dir, self.connect_timeout);

        // establishes the control master and proves the host is reachable
        let out = conn.exec("true", &CancellationToken::new()).await?;
        if !out.success() {
            return Err(Error::connection(
                host.name(),
                format!("handshake exited {}: {}", out.exit_code, out.stderr.trim()),
            ));
        }

        info!(host = %host.name(), address = %host.ssh_address(), "ssh connection established");
        Ok(Arc::new(conn))
    }
}

/// One multiplexed SSH session to a host
#[derive(Debug, Clone)]
pub struct SshConnection {
    host: String,
    destination: String,
    options: Vec<String>,
    agent_socket: Option<String>,
}

impl SshConnection {
    fn new(host: &HostConfig, control_dir: &Path, connect_timeout: Duration) -> Self {
        let destination = format!("{}@{}", host.ssh.username, host.ssh_address());
        Self {
            host: host.name().to_string(),
            options: ssh_options(host, control_dir, connect_timeout),
            destination,
            agent_socket: host.ssh.agent_socket.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(&self.options);
        if let Some(socket) = &self.agent_socket {
            cmd.env("SSH_AUTH_SOCK", socket);
        }
        cmd
    }
}

/// Build the option list shared by every ssh invocation for `host`
pub(crate) fn ssh_options(host: &HostConfig, control_dir: &Path, timeout: Duration) -> Vec<String> {
    let control_path = control_dir.join(format!(
        "{}-{}-{}",
        host.ssh.username,
        host.ssh_address(),
        host.ssh.port
    ));

    let mut options = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", timeout.as_secs().max(1)),
        "-o".to_string(),
        "ControlMaster=auto".to_string(),
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
        "-o".to_string(),
        format!("ControlPersist={}", CONTROL_PERSIST),
        "-p".to_string(),
        host.ssh.port.to_string(),
    ];

    if let Some(key) = &host.ssh.private_key_file {
        options.push("-i".to_string());
        options.push(key.display().to_string());
    }

    if let Some(bastion) = &host.bastion {
        let user = bastion.username.as_deref().unwrap_or(&host.ssh.username);
        options.push("-J".to_string());
        options.push(format!("{}@{}:{}", user, bastion.address, bastion.port));
    }

    options
}

#[async_trait]
impl Executor for SshConnection {
    async fn stream(
        &self,
        command: &str,
        io: StreamIo<'_>,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        debug!(host = %self.host, command = %command, "running remote command");
        let mut cmd = self.command();
        cmd.arg(&self.destination).arg("--").arg(command);

        let code = drive(&self.host, cmd, io, cancel).await?;
        if code == SSH_TRANSPORT_EXIT {
            return Err(Error::connection(
                &self.host,
                "ssh exited 255 (transport failure)",
            ));
        }
        Ok(code)
    }

    async fn close(&self) -> Result<()> {
        let status = self
            .command()
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            warn!(host = %self.host, "ssh control master was already gone");
        }
        Ok(())
    }
}

#[async_trait]
impl Tunneler for SshConnection {
    async fn tunnel(&self, addr: &str, cancel: &CancellationToken) -> Result<Box<dyn AsyncStream>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut child = self
            .command()
            .arg("-W")
            .arg(addr)
            .arg(&self.destination)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::connection(&self.host, format!("tunnel to {}: {}", addr, e)))?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                return Err(Error::internal_with_context(
                    "ssh",
                    "tunnel stdio not captured",
                ))
            }
        };

        debug!(host = %self.host, addr = %addr, "ssh tunnel opened");
        Ok(Box::new(SshTunnel {
            _child: child,
            stdin,
            stdout,
        }))
    }
}

impl Connection for SshConnection {
    fn host(&self) -> &str {
        &self.host
    }
}

/// `ssh -W` child exposed as a byte stream; the child dies with the stream
struct SshTunnel {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for SshTunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for SshTunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}
