//! etcd client over the v3 JSON gateway
//!
//! etcd only listens on the control-plane hosts, so every request goes
//! through a [`LocalForward`] opened on the leader's connection. Requests
//! authenticate with the kubeadm healthcheck client certificate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use keel_common::{Error, Result, DEFAULT_ETCD_CLIENT_PORT};
use keel_executor::{LocalForward, Runner};

const ETCD_PKI_DIR: &str = "/etc/kubernetes/pki/etcd";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One etcd cluster member
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct EtcdMember {
    /// Member id
    #[serde(rename = "ID", deserialize_with = "u64_from_string_or_number")]
    pub id: u64,
    /// Member name (kubeadm uses the node name)
    #[serde(default)]
    pub name: String,
    /// Peer URLs
    #[serde(rename = "peerURLs", default)]
    pub peer_urls: Vec<String>,
    /// Client URLs
    #[serde(rename = "clientURLs", default)]
    pub client_urls: Vec<String>,
}

impl EtcdMember {
    /// Name plus the hosts of every advertised client URL
    pub fn identities(&self) -> Vec<String> {
        let mut identities = Vec::new();
        if !self.name.is_empty() {
            identities.push(self.name.clone());
        }
        for raw in &self.client_urls {
            if let Some(host) = url_host(raw) {
                if !identities.contains(&host) {
                    identities.push(host);
                }
            }
        }
        identities
    }
}

/// Host part of an etcd URL
pub fn url_host(raw: &str) -> Option<String> {
    Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).to_string()))
}

fn u64_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    members: Vec<EtcdMember>,
}

#[derive(Serialize)]
struct MemberRemoveRequest {
    #[serde(rename = "ID")]
    id: String,
}

/// Membership operations keel needs from etcd
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EtcdApi: Send + Sync {
    /// Current members
    async fn member_list(&self) -> Result<Vec<EtcdMember>>;

    /// Query the status endpoint of the member serving `client_url`
    async fn member_status(&self, client_url: &str) -> Result<()>;

    /// Remove a member by id
    async fn member_remove(&self, id: u64) -> Result<()>;
}

/// Builds an [`EtcdApi`] reaching etcd through the leader
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EtcdProvider: Send + Sync {
    /// Connect through `leader`
    async fn connect(&self, leader: Runner) -> Result<Arc<dyn EtcdApi>>;
}

/// Provider for [`EtcdGateway`]
#[derive(Debug, Clone, Default)]
pub struct GatewayProvider;

#[async_trait]
impl EtcdProvider for GatewayProvider {
    async fn connect(&self, leader: Runner) -> Result<Arc<dyn EtcdApi>> {
        Ok(Arc::new(EtcdGateway::connect(leader).await?))
    }
}

/// etcd v3 JSON gateway client
pub struct EtcdGateway {
    leader: Runner,
    client: reqwest::Client,
    // one forward per member endpoint, keyed by `host:port`
    forwards: Mutex<HashMap<String, Arc<LocalForward>>>,
}

impl EtcdGateway {
    /// Fetch client credentials from the leader and build the HTTPS client
    pub async fn connect(leader: Runner) -> Result<Self> {
        let sudo_cat = |file: &str| format!("sudo cat {}/{}", ETCD_PKI_DIR, file);
        let ca = leader.capture(&sudo_cat("ca.crt")).await?;
        let mut identity = leader.capture(&sudo_cat("healthcheck-client.crt")).await?;
        identity.extend(leader.capture(&sudo_cat("healthcheck-client.key")).await?);

        let ca = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| Error::etcd(format!("invalid etcd CA: {}", e)))?;
        let identity = reqwest::Identity::from_pem(&identity)
            .map_err(|e| Error::etcd(format!("invalid etcd client identity: {}", e)))?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::etcd(format!("failed to build etcd client: {}", e)))?;

        info!(leader = %leader.host(), "etcd client ready");
        Ok(Self {
            leader,
            client,
            forwards: Mutex::new(HashMap::new()),
        })
    }

    async fn forward_for(&self, endpoint: &str) -> Result<Arc<LocalForward>> {
        let cached = self.forwards.lock().get(endpoint).cloned();
        if let Some(forward) = cached {
            return Ok(forward);
        }
        let forward = Arc::new(
            LocalForward::open(self.leader.connection(), endpoint, self.leader.cancel_token())
                .await?,
        );
        self.forwards
            .lock()
            .insert(endpoint.to_string(), forward.clone());
        Ok(forward)
    }

    async fn post<B: Serialize + Sync>(
        &self,
        endpoint: &str,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let forward = self.forward_for(endpoint).await?;
        let url = format!("{}{}", forward.https_url(), path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::http(format!("{}{}", endpoint, path), e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::http(
                format!("{}{}", endpoint, path),
                format!("status {}", response.status()),
            ));
        }
        Ok(response)
    }
}

/// `host:port` of a client URL, as dialed from the leader
pub fn endpoint_of(client_url: &str) -> Result<String> {
    let url = Url::parse(client_url)
        .map_err(|e| Error::etcd(format!("invalid client url {}: {}", client_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::etcd(format!("client url {} has no host", client_url)))?;
    let port = url.port().unwrap_or(DEFAULT_ETCD_CLIENT_PORT);
    if host.contains(':') && !host.starts_with('[') {
        Ok(format!("[{}]:{}", host, port))
    } else {
        Ok(format!("{}:{}", host, port))
    }
}

#[async_trait]
impl EtcdApi for EtcdGateway {
    async fn member_list(&self) -> Result<Vec<EtcdMember>> {
        let local = format!("127.0.0.1:{}", DEFAULT_ETCD_CLIENT_PORT);
        let response = self.post(&local, "/v3/cluster/member/list", &json!({})).await?;
        let list: MemberListResponse = response
            .json()
            .await
            .map_err(|e| Error::etcd(format!("invalid member list: {}", e)))?;
        debug!(members = list.members.len(), "listed etcd members");
        Ok(list.members)
    }

    async fn member_status(&self, client_url: &str) -> Result<()> {
        let endpoint = endpoint_of(client_url)?;
        self.post(&endpoint, "/v3/maintenance/status", &json!({}))
            .await
            .map(|_| ())
    }

    async fn member_remove(&self, id: u64) -> Result<()> {
        let local = format!("127.0.0.1:{}", DEFAULT_ETCD_CLIENT_PORT);
        self.post(
            &local,
            "/v3/cluster/member/remove",
            &MemberRemoveRequest { id: id.to_string() },
        )
        .await?;
        info!(member_id = id, "removed etcd member");
        Ok(())
    }
}
