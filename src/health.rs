//! API server health checks through a host tunnel
//!
//! The API server answers `/healthz` with a plaintext `ok` and `/version`
//! with its build info. Both are readable anonymously on kubeadm clusters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use semver::Version;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use keel_cluster::parse_version;
use keel_common::{Error, Result, DEFAULT_APISERVER_PORT};
use keel_executor::{Connection, LocalForward};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one API server probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiServerHealth {
    /// `/healthz` answered `ok`
    pub healthy: bool,
    /// Version reported by `/version`, when readable
    pub version: Option<Version>,
}

/// Checks the API server running on a host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApiServerProbe: Send + Sync {
    /// Probe the API server local to `conn`'s host; never fails, unhealthy instead
    async fn probe(&self, conn: Arc<dyn Connection>, cancel: &CancellationToken)
        -> ApiServerHealth;
}

/// Probe over HTTPS through a local forward
#[derive(Debug, Clone)]
pub struct HttpApiServerProbe {
    timeout: Duration,
}

impl Default for HttpApiServerProbe {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    git_version: String,
}

impl HttpApiServerProbe {
    async fn check(
        &self,
        conn: Arc<dyn Connection>,
        cancel: &CancellationToken,
    ) -> Result<ApiServerHealth> {
        let host = conn.host().to_string();
        let forward = LocalForward::open(
            conn,
            format!("127.0.0.1:{}", DEFAULT_APISERVER_PORT),
            cancel,
        )
        .await?;
        let base = forward.https_url();

        // serving cert is issued for the node addresses, not loopback
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::http(&base, e.to_string()))?;

        let endpoint = format!("{}/healthz", base);
        let body = client
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| Error::http(&endpoint, e.to_string()))?
            .text()
            .await
            .map_err(|e| Error::http(&endpoint, e.to_string()))?;
        let healthy = is_ok_body(&body);
        debug!(host = %host, healthy, "api server healthz");
        if !healthy {
            return Ok(ApiServerHealth::default());
        }

        let endpoint = format!("{}/version", base);
        let version = match client.get(&endpoint).send().await {
            Ok(response) => response
                .json::<VersionInfo>()
                .await
                .ok()
                .and_then(|info| parse_version(&info.git_version).ok()),
            Err(e) => {
                debug!(host = %host, error = %e, "api server version unavailable");
                None
            }
        };

        Ok(ApiServerHealth { healthy, version })
    }
}

/// `/healthz` success body
pub fn is_ok_body(body: &str) -> bool {
    body.trim() == "ok"
}

#[async_trait]
impl ApiServerProbe for HttpApiServerProbe {
    async fn probe(
        &self,
        conn: Arc<dyn Connection>,
        cancel: &CancellationToken,
    ) -> ApiServerHealth {
        let host = conn.host().to_string();
        match self.check(conn, cancel).await {
            Ok(health) => health,
            Err(e) => {
                debug!(host = %host, error = %e, "api server probe failed");
                ApiServerHealth::default()
            }
        }
    }
}
