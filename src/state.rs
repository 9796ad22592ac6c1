//! Orchestration state handed to every task
//!
//! A [`State`] is a bundle of shared handles. Cloning it is cheap and is how
//! parallel fan-out gives each host its own worker context: the clone gets a
//! host specific [`Runner`] while the live cluster, the desired config and
//! the session stay shared.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use keel_cluster::{ClusterConfig, HostConfig, LiveCluster, SharedCluster};
use keel_common::retry::RetryConfig;
use keel_common::{Error, Result};
use keel_executor::{Adapter, Connector, Runner};

use crate::cluster_api::{ClusterApi, ClusterApiProvider, KubeconfigProvider};
use crate::etcd::{EtcdProvider, GatewayProvider};
use crate::health::{ApiServerProbe, HttpApiServerProbe};
use crate::scripts::{Params, Scripts};

/// Default scratch directory on the hosts
pub const DEFAULT_WORK_DIR: &str = "/root/keel";

/// Pause after a risky step before probing again
pub const DEFAULT_STABILIZE_PAUSE: Duration = Duration::from_secs(20);

/// Per-invocation options
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Tee command output and pass `--v=6` to kubeadm
    pub verbose: bool,
    /// Downgrade version-skew failures to warnings
    pub force_upgrade: bool,
    /// Install even when the cluster looks provisioned
    pub force_install: bool,
    /// Reset static workers too
    pub destroy_workers: bool,
    /// Version to upgrade/repair to instead of the manifest's
    pub target_version: Option<String>,
    /// Scratch directory on the hosts
    pub work_dir: String,
    /// Backoff used by every task
    pub backoff: RetryConfig,
    /// Pause between risky steps
    pub stabilize: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            force_upgrade: false,
            force_install: false,
            destroy_workers: false,
            target_version: None,
            work_dir: DEFAULT_WORK_DIR.to_string(),
            backoff: RetryConfig::default(),
            stabilize: DEFAULT_STABILIZE_PAUSE,
        }
    }
}

/// External collaborators reached through the leader
#[derive(Clone)]
pub struct Backends {
    /// API server health probe
    pub api_server: Arc<dyn ApiServerProbe>,
    /// etcd client factory
    pub etcd: Arc<dyn EtcdProvider>,
    /// Kubernetes client factory
    pub cluster_api: Arc<dyn ClusterApiProvider>,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            api_server: Arc::new(HttpApiServerProbe::default()),
            etcd: Arc::new(GatewayProvider),
            cluster_api: Arc::new(KubeconfigProvider),
        }
    }
}

/// Values produced by one task and consumed by later ones
#[derive(Default)]
struct Session {
    cluster_api: Option<Arc<dyn ClusterApi>>,
    kubeconfig: Option<Vec<u8>>,
}

/// Everything a task can see
#[derive(Clone)]
pub struct State {
    /// Desired configuration (only discovery writes to it)
    pub config: Arc<RwLock<ClusterConfig>>,
    /// Observed cluster, shared by every worker
    pub live: SharedCluster,
    /// Per-host connection cache
    pub connector: Arc<Connector>,
    /// Collaborators reached through the leader
    pub backends: Backends,
    /// Script templates
    pub scripts: Arc<Scripts>,
    /// Invocation options
    pub options: Arc<RunOptions>,
    /// Cancels in-flight commands
    pub cancel: CancellationToken,
    /// Runner of the host this worker acts on
    pub runner: Option<Runner>,
    session: Arc<RwLock<Session>>,
}

impl State {
    /// Build the root state for one invocation
    pub fn new(
        config: ClusterConfig,
        adapter: Arc<dyn Adapter>,
        backends: Backends,
        scripts: Scripts,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        let live = LiveCluster::from_config(&config).shared();
        Self {
            config: Arc::new(RwLock::new(config)),
            live,
            connector: Arc::new(Connector::new(adapter)),
            backends,
            scripts: Arc::new(scripts),
            options: Arc::new(options),
            cancel,
            runner: None,
            session: Arc::new(RwLock::new(Session::default())),
        }
    }

    /// A worker context bound to `host`
    pub async fn for_host(&self, host: &HostConfig) -> Result<State> {
        let conn = self.connector.connect(host).await?;
        let mut worker = self.clone();
        worker.runner = Some(Runner::new(conn, self.options.verbose, self.cancel.clone()));
        Ok(worker)
    }

    /// The runner of this worker
    pub fn runner(&self) -> Result<&Runner> {
        self.runner
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("state", "task needs a host runner"))
    }

    /// Render `script` for `node` with the common parameters filled in
    pub fn script(
        &self,
        script: crate::scripts::Script,
        node: &str,
        extra: impl FnOnce(Params) -> Params,
    ) -> Result<String> {
        let params = extra(Params::new(
            &self.options.work_dir,
            node,
            self.options.verbose,
        ));
        self.scripts.render(script, params)
    }

    /// A snapshot of the desired configuration
    pub fn config_snapshot(&self) -> ClusterConfig {
        self.config.read().clone()
    }

    /// The leader's configuration
    pub fn leader(&self) -> Result<HostConfig> {
        self.config.read().leader().cloned().ok_or_else(|| {
            Error::manual_intervention("no control-plane host is elected leader")
        })
    }

    /// Version tasks should converge to
    pub fn target_version(&self) -> Result<semver::Version> {
        match &self.options.target_version {
            Some(raw) => keel_cluster::parse_version(raw),
            None => self.config.read().kubernetes_version(),
        }
    }

    /// Kubernetes API client, once cluster investigation connected it
    pub fn cluster_api(&self) -> Result<Arc<dyn ClusterApi>> {
        self.session.read().cluster_api.clone().ok_or_else(|| {
            Error::internal_with_context("state", "kubernetes client not connected")
        })
    }

    /// Whether a Kubernetes API client is connected
    pub fn has_cluster_api(&self) -> bool {
        self.session.read().cluster_api.is_some()
    }

    /// Store the connected Kubernetes API client
    pub fn set_cluster_api(&self, api: Arc<dyn ClusterApi>) {
        self.session.write().cluster_api = Some(api);
    }

    /// Admin kubeconfig downloaded from the leader
    pub fn kubeconfig(&self) -> Option<Vec<u8>> {
        self.session.read().kubeconfig.clone()
    }

    /// Store the admin kubeconfig
    pub fn set_kubeconfig(&self, kubeconfig: Vec<u8>) {
        self.session.write().kubeconfig = Some(kubeconfig);
    }

    /// Evict the cached connection of a host after a transport failure
    pub async fn drop_connection(&self, host: &HostConfig) {
        self.connector.forget(host).await;
    }
}
