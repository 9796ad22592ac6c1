//! Per-host connection cache
//!
//! Connections are reused across tasks of one run. A transport failure must
//! evict the cached connection so the next operation on that host dials again.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use keel_cluster::HostConfig;
use keel_common::Result;

use crate::executor::{Adapter, Connection};

/// Caches one [`Connection`] per host
pub struct Connector {
    adapter: Arc<dyn Adapter>,
    connections: DashMap<String, Arc<dyn Connection>>,
}

fn cache_key(host: &HostConfig) -> String {
    format!(
        "{}@{}:{}",
        host.ssh.username,
        host.ssh_address(),
        host.ssh.port
    )
}

impl Connector {
    /// A cache in front of `adapter`
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            adapter,
            connections: DashMap::new(),
        }
    }

    /// The cached connection for `host`, opening one when needed
    pub async fn connect(&self, host: &HostConfig) -> Result<Arc<dyn Connection>> {
        let key = cache_key(host);
        if let Some(conn) = self.connections.get(&key) {
            return Ok(conn.clone());
        }

        debug!(host = %host.name(), "opening connection");
        let conn = self.adapter.open(host).await?;
        let conn = self.connections.entry(key).or_insert(conn).clone();
        Ok(conn)
    }

    /// Close and evict the connection for `host`
    pub async fn forget(&self, host: &HostConfig) {
        if let Some((_, conn)) = self.connections.remove(&cache_key(host)) {
            info!(host = %host.name(), "dropping cached connection");
            if let Err(e) = conn.close().await {
                warn!(host = %host.name(), error = %e, "failed to close connection");
            }
        }
    }

    /// Number of cached connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// No connection is cached
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every cached connection
    pub async fn close_all(&self) {
        let keys: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, conn)) = self.connections.remove(&key) {
                if let Err(e) = conn.close().await {
                    warn!(host = %conn.host(), error = %e, "failed to close connection");
                }
            }
        }
    }
}
