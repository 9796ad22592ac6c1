//! Executor and tunnel traits shared by every adapter
//!
//! An [`Adapter`] opens one [`Connection`] per host. A connection runs
//! commands (collected or streamed) and can dial TCP endpoints as seen from
//! the host, which is how health endpoints and etcd are reached without
//! exposing their ports.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use keel_cluster::HostConfig;
use keel_common::{Error, Result};

/// Byte stream returned by a tunnel
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
    /// Process exit code (-1 when killed by a signal)
    pub exit_code: i32,
}

impl ExecOutput {
    /// Exit code zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Caller supplied sinks for [`Executor::stream`]
pub struct StreamIo<'a> {
    /// Fed to the remote stdin, then closed
    pub stdin: Option<&'a mut (dyn AsyncRead + Unpin + Send)>,
    /// Receives remote stdout byte for byte
    pub stdout: &'a mut (dyn AsyncWrite + Unpin + Send),
    /// Receives remote stderr byte for byte
    pub stderr: &'a mut (dyn AsyncWrite + Unpin + Send),
}

/// Runs commands on one host
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `command`, wiring its stdio to the caller's sinks, and return the exit code
    ///
    /// A non-zero exit is not an error here; transport failures are.
    async fn stream(
        &self,
        command: &str,
        io: StreamIo<'_>,
        cancel: &CancellationToken,
    ) -> Result<i32>;

    /// Run `command` and collect its output
    async fn exec(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutput> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit_code = self
            .stream(
                command,
                StreamIo {
                    stdin: None,
                    stdout: &mut stdout,
                    stderr: &mut stderr,
                },
                cancel,
            )
            .await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    /// Release the underlying channel
    async fn close(&self) -> Result<()>;
}

/// Dials TCP endpoints as if from the host
#[async_trait]
pub trait Tunneler: Send + Sync {
    /// Open a raw byte stream to `addr` (`host:port`, resolved on the host)
    async fn tunnel(&self, addr: &str, cancel: &CancellationToken) -> Result<Box<dyn AsyncStream>>;
}

/// Both capabilities for one host
pub trait Connection: Executor + Tunneler {
    /// Host name used in logs and errors
    fn host(&self) -> &str;
}

/// Opens connections to configured hosts
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Open a fresh connection to `host`
    async fn open(&self, host: &HostConfig) -> Result<Arc<dyn Connection>>;
}

/// Run a prepared command to completion, pumping stdio through `io`
///
/// The child is killed when `cancel` fires; its exit code is returned
/// otherwise (-1 when it died from a signal).
pub(crate) async fn drive(
    host: &str,
    mut command: Command,
    io: StreamIo<'_>,
    cancel: &CancellationToken,
) -> Result<i32> {
    let StreamIo {
        stdin,
        stdout,
        stderr,
    } = io;

    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| Error::connection(host, format!("failed to spawn: {}", e)))?;

    let child_stdin = child.stdin.take();
    let mut child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::internal_with_context("executor", "child stdout not captured"))?;
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::internal_with_context("executor", "child stderr not captured"))?;

    let feed = async move {
        if let (Some(src), Some(mut dst)) = (stdin, child_stdin) {
            tokio::io::copy(src, &mut dst).await?;
            dst.shutdown().await?;
        }
        Ok::<_, std::io::Error>(())
    };

    let pump = async {
        tokio::try_join!(
            feed,
            tokio::io::copy(&mut child_stdout, stdout),
            tokio::io::copy(&mut child_stderr, stderr),
        )
    };

    tokio::select! {
        pumped = pump => {
            pumped.map_err(|e| Error::connection(host, format!("stream failed: {}", e)))?;
        }
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        }
    };

    Ok(status.code().unwrap_or(-1))
}
