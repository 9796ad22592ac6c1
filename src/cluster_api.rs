//! Kubernetes API access
//!
//! The admin kubeconfig downloaded from the leader points at addresses that
//! may not be reachable from where keel runs, so the client is pointed at a
//! local forward of the leader's loopback API server instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use keel_common::{Error, Result, CONTROL_PLANE_NODE_LABEL, DEFAULT_APISERVER_PORT};
use keel_executor::{Connection, LocalForward};

/// Name every kubeadm API server certificate is issued for
const APISERVER_TLS_NAME: &str = "kubernetes";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const CCM_NAME_FRAGMENT: &str = "cloud-controller-manager";

/// Cluster-scoped reads and writes keel performs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of every Node object
    async fn node_names(&self) -> Result<Vec<String>>;

    /// Names of Node objects carrying the control-plane role label
    async fn control_plane_node_names(&self) -> Result<Vec<String>>;

    /// Delete a Node object; deleting an absent node succeeds
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// An external cloud-controller-manager workload exists in kube-system
    async fn external_ccm_deployed(&self) -> Result<bool>;
}

/// Builds a [`ClusterApi`] from the leader's admin kubeconfig
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApiProvider: Send + Sync {
    /// Connect through `leader` using `kubeconfig`
    async fn connect(
        &self,
        leader: Arc<dyn Connection>,
        kubeconfig: Vec<u8>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn ClusterApi>>;
}

/// [`ClusterApi`] backed by kube-rs
pub struct KubeClusterApi {
    client: Client,
    // keeps the tunnel alive for the client's lifetime
    _forward: LocalForward,
}

/// Provider for [`KubeClusterApi`]
#[derive(Debug, Clone, Default)]
pub struct KubeconfigProvider;

#[async_trait]
impl ClusterApiProvider for KubeconfigProvider {
    async fn connect(
        &self,
        leader: Arc<dyn Connection>,
        kubeconfig: Vec<u8>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn ClusterApi>> {
        let host = leader.host().to_string();
        let forward = LocalForward::open(
            leader,
            format!("127.0.0.1:{}", DEFAULT_APISERVER_PORT),
            &cancel,
        )
        .await?;

        let config = client_config(&kubeconfig, &forward.https_url()).await?;
        let client = Client::try_from(config)?;
        info!(leader = %host, "kubernetes client ready");

        Ok(Arc::new(KubeClusterApi {
            client,
            _forward: forward,
        }))
    }
}

/// Client config from a kubeconfig, redirected to `cluster_url`
pub async fn client_config(kubeconfig: &[u8], cluster_url: &str) -> Result<Config> {
    let raw = std::str::from_utf8(kubeconfig)
        .map_err(|e| Error::config(format!("kubeconfig is not utf-8: {}", e)))?;
    let kubeconfig = Kubeconfig::from_yaml(raw)
        .map_err(|e| Error::config(format!("invalid kubeconfig: {}", e)))?;

    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("unusable kubeconfig: {}", e)))?;

    config.cluster_url = cluster_url
        .parse()
        .map_err(|e| Error::config(format!("invalid cluster url {}: {}", cluster_url, e)))?;
    config.tls_server_name = Some(APISERVER_TLS_NAME.to_string());
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}

impl KubeClusterApi {
    async fn list_node_names(&self, params: &ListParams) -> Result<Vec<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(params).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|n| n.metadata.name)
            .collect())
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn node_names(&self) -> Result<Vec<String>> {
        self.list_node_names(&ListParams::default()).await
    }

    async fn control_plane_node_names(&self) -> Result<Vec<String>> {
        self.list_node_names(&ListParams::default().labels(CONTROL_PLANE_NODE_LABEL))
            .await
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(node = %name, "deleted node");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(node = %name, "node already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn external_ccm_deployed(&self) -> Result<bool> {
        let daemonsets: Api<DaemonSet> = Api::namespaced(self.client.clone(), "kube-system");
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), "kube-system");

        let ds = daemonsets.list(&ListParams::default()).await?;
        let deploy = deployments.list(&ListParams::default()).await?;

        let names = ds
            .items
            .into_iter()
            .filter_map(|d| d.metadata.name)
            .chain(deploy.items.into_iter().filter_map(|d| d.metadata.name));
        Ok(any_ccm(names))
    }
}

fn any_ccm(mut names: impl Iterator<Item = String>) -> bool {
    names.any(|n| n.contains(CCM_NAME_FRAGMENT))
}
