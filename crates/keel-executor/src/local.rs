//! Local shell adapter
//!
//! Commands run through `sh -c` on the machine keel runs on and tunnels are
//! plain TCP dials. Used for self-managed single-node targets and tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use keel_cluster::HostConfig;
use keel_common::{Error, Result};

use crate::executor::{drive, Adapter, AsyncStream, Connection, Executor, StreamIo, Tunneler};

/// Opens [`LocalConnection`]s regardless of the host's address
#[derive(Debug, Clone, Default)]
pub struct LocalAdapter;

impl LocalAdapter {
    /// Create a local adapter
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    async fn open(&self, host: &HostConfig) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(LocalConnection::new(host.name())))
    }
}

/// Runs commands in a local shell
#[derive(Debug, Clone)]
pub struct LocalConnection {
    host: String,
}

impl LocalConnection {
    /// A local connection reporting itself as `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl Executor for LocalConnection {
    async fn stream(
        &self,
        command: &str,
        io: StreamIo<'_>,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        debug!(host = %self.host, command = %command, "running local command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        drive(&self.host, cmd, io, cancel).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Tunneler for LocalConnection {
    async fn tunnel(&self, addr: &str, cancel: &CancellationToken) -> Result<Box<dyn AsyncStream>> {
        let stream = tokio::select! {
            stream = TcpStream::connect(addr) => stream
                .map_err(|e| Error::connection(&self.host, format!("dial {}: {}", addr, e)))?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        Ok(Box::new(stream))
    }
}

impl Connection for LocalConnection {
    fn host(&self) -> &str {
        &self.host
    }
}
