//! Local port forwarding over a host tunnel
//!
//! HTTP clients (reqwest, kube) need a socket address. A [`LocalForward`]
//! listens on an ephemeral loopback port and bridges every accepted
//! connection to a fresh tunnel opened through the host.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use keel_common::Result;

use crate::executor::Connection;

/// A loopback listener forwarding to `remote` as seen from a host
///
/// Dropping the forward stops accepting and tears down open bridges.
#[derive(Debug)]
pub struct LocalForward {
    local_addr: SocketAddr,
    remote: String,
    cancel: CancellationToken,
}

impl LocalForward {
    /// Start forwarding `127.0.0.1:<ephemeral>` to `remote` through `conn`
    pub async fn open(
        conn: Arc<dyn Connection>,
        remote: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let remote = remote.into();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let cancel = cancel.child_token();

        debug!(
            host = %conn.host(),
            local = %local_addr,
            remote = %remote,
            "local forward listening"
        );

        tokio::spawn(accept_loop(listener, conn, remote.clone(), cancel.clone()));

        Ok(Self {
            local_addr,
            remote,
            cancel,
        })
    }

    /// The loopback address to dial
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint on the far side
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// `https://127.0.0.1:<port>`
    pub fn https_url(&self) -> String {
        format!("https://{}", self.local_addr)
    }
}

impl Drop for LocalForward {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    conn: Arc<dyn Connection>,
    remote: String,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => return,
        };

        match accepted {
            Ok((inbound, _)) => {
                tokio::spawn(bridge(inbound, conn.clone(), remote.clone(), cancel.clone()));
            }
            Err(e) => {
                warn!(host = %conn.host(), error = %e, "local forward accept failed");
                return;
            }
        }
    }
}

async fn bridge(
    mut inbound: TcpStream,
    conn: Arc<dyn Connection>,
    remote: String,
    cancel: CancellationToken,
) {
    let mut upstream = match conn.tunnel(&remote, &cancel).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host = %conn.host(), remote = %remote, error = %e, "tunnel failed");
            return;
        }
    };

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut inbound, &mut upstream) => match copied {
            Ok((up, down)) => debug!(remote = %remote, up, down, "bridge closed"),
            Err(e) => debug!(remote = %remote, error = %e, "bridge ended with error"),
        },
        _ = cancel.cancelled() => {}
    }
}
