//! Scripted hosts and fake collaborators shared by the orchestration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use keel::cluster_api::{ClusterApi, ClusterApiProvider};
use keel::etcd::{EtcdApi, EtcdMember, EtcdProvider};
use keel::health::{ApiServerHealth, ApiServerProbe};
use keel::scripts::Scripts;
use keel::{Backends, RunOptions, State};
use keel_cluster::{ClusterConfig, HostConfig, HostGroup, OperatingSystem, VersionConfig};
use keel_common::retry::RetryConfig;
use keel_common::{Error, Result};
use keel_executor::{Adapter, AsyncStream, Connection, Executor, StreamIo, Tunneler};

/// What a scripted command does
#[derive(Debug, Clone)]
pub enum Reply {
    /// Exit with `code` after printing `stdout`
    Exit { stdout: String, code: i32 },
    /// The channel breaks
    Transport,
}

impl Reply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Reply::Exit {
            stdout: stdout.into(),
            code: 0,
        }
    }

    pub fn fail(code: i32) -> Self {
        Reply::Exit {
            stdout: String::new(),
            code,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    host: Option<String>,
    contains: String,
    reply: Reply,
}

/// Hosts whose commands are answered from a rule table
///
/// Host specific rules win over rules for every host; a command no rule
/// matches succeeds silently.
#[derive(Default)]
pub struct ScriptedAdapter {
    rules: Arc<Mutex<Vec<Rule>>>,
    log: Arc<Mutex<Vec<(String, String)>>>,
    opens: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer commands containing `contains` on every host
    pub fn on(self: &Arc<Self>, contains: &str, reply: Reply) -> Arc<Self> {
        self.rules.lock().push(Rule {
            host: None,
            contains: contains.to_string(),
            reply,
        });
        self.clone()
    }

    /// Answer commands containing `contains` on `host` only
    pub fn on_host(self: &Arc<Self>, host: &str, contains: &str, reply: Reply) -> Arc<Self> {
        self.rules.lock().insert(
            0,
            Rule {
                host: Some(host.to_string()),
                contains: contains.to_string(),
                reply,
            },
        );
        self.clone()
    }

    /// Every `(host, command)` run so far, in order
    pub fn commands(&self) -> Vec<(String, String)> {
        self.log.lock().clone()
    }

    /// Hosts that ran a command containing `contains`
    pub fn hosts_that_ran(&self, contains: &str) -> HashSet<String> {
        self.log
            .lock()
            .iter()
            .filter(|(_, c)| c.contains(contains))
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Connections opened so far
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    async fn open(&self, host: &HostConfig) -> Result<Arc<dyn Connection>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedConnection {
            host: host.name().to_string(),
            rules: self.rules.clone(),
            log: self.log.clone(),
        }))
    }
}

/// One scripted host
pub struct ScriptedConnection {
    host: String,
    rules: Arc<Mutex<Vec<Rule>>>,
    log: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedConnection {
    fn reply(&self, command: &str) -> Reply {
        self.rules
            .lock()
            .iter()
            .filter(|r| r.host.as_deref().map_or(true, |h| h == self.host))
            .find(|r| command.contains(&r.contains))
            .map(|r| r.reply.clone())
            .unwrap_or_else(|| Reply::ok(""))
    }
}

#[async_trait]
impl Executor for ScriptedConnection {
    async fn stream(
        &self,
        command: &str,
        mut io: StreamIo<'_>,
        _cancel: &CancellationToken,
    ) -> Result<i32> {
        self.log
            .lock()
            .push((self.host.clone(), command.to_string()));
        match self.reply(command) {
            Reply::Transport => Err(Error::connection(&self.host, "connection reset by peer")),
            Reply::Exit { stdout, code } => {
                io.stdout.write_all(stdout.as_bytes()).await?;
                Ok(code)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Tunneler for ScriptedConnection {
    async fn tunnel(&self, addr: &str, _cancel: &CancellationToken) -> Result<Box<dyn AsyncStream>> {
        Err(Error::connection(&self.host, format!("no tunnel to {}", addr)))
    }
}

impl Connection for ScriptedConnection {
    fn host(&self) -> &str {
        &self.host
    }
}

/// A manifest with `control_plane` + `workers` Ubuntu hosts at 1.29.3
pub fn cluster_config(control_plane: usize, workers: usize) -> ClusterConfig {
    let host = |id: usize, name: String| HostConfig {
        id,
        hostname: name,
        public_address: format!("10.0.0.{}", id + 10),
        private_address: format!("192.168.0.{}", id + 10),
        operating_system: OperatingSystem::Ubuntu,
        ..Default::default()
    };
    ClusterConfig {
        name: "test".to_string(),
        versions: VersionConfig {
            kubernetes: "1.29.3".to_string(),
        },
        control_plane: HostGroup {
            hosts: (0..control_plane)
                .map(|i| host(i, format!("cp-{}", i)))
                .collect(),
        },
        static_workers: HostGroup {
            hosts: (0..workers)
                .map(|i| host(control_plane + i, format!("w-{}", i)))
                .collect(),
        },
        ..Default::default()
    }
}

/// Options with millisecond backoff and no stabilisation pause
pub fn fast_options() -> RunOptions {
    RunOptions {
        backoff: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
        stabilize: Duration::ZERO,
        ..Default::default()
    }
}

/// Root state over `adapter`
pub fn state_with(
    config: ClusterConfig,
    adapter: Arc<dyn Adapter>,
    backends: Backends,
    options: RunOptions,
) -> State {
    State::new(
        config,
        adapter,
        backends,
        Scripts::embedded(),
        options,
        CancellationToken::new(),
    )
}

/// API servers answering healthy on the listed hosts only
pub struct FakeApiServers {
    pub healthy: HashSet<String>,
    pub version: &'static str,
}

#[async_trait]
impl ApiServerProbe for FakeApiServers {
    async fn probe(&self, conn: Arc<dyn Connection>, _cancel: &CancellationToken) -> ApiServerHealth {
        if self.healthy.contains(conn.host()) {
            ApiServerHealth {
                healthy: true,
                version: keel_cluster::parse_version(self.version).ok(),
            }
        } else {
            ApiServerHealth::default()
        }
    }
}

/// In-memory etcd membership
#[derive(Default)]
pub struct FakeEtcd {
    pub members: Mutex<Vec<EtcdMember>>,
    pub unreachable: HashSet<String>,
    pub removed: Mutex<Vec<u64>>,
}

impl FakeEtcd {
    pub fn with_members(names: &[&str], unreachable: &[&str]) -> Arc<Self> {
        let members = names
            .iter()
            .enumerate()
            .map(|(i, name)| EtcdMember {
                id: i as u64 + 1,
                name: name.to_string(),
                peer_urls: vec![format!("https://{}:2380", name)],
                client_urls: vec![format!("https://{}:2379", name)],
            })
            .collect();
        Arc::new(Self {
            members: Mutex::new(members),
            unreachable: unreachable.iter().map(|s| s.to_string()).collect(),
            removed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EtcdApi for FakeEtcd {
    async fn member_list(&self) -> Result<Vec<EtcdMember>> {
        Ok(self.members.lock().clone())
    }

    async fn member_status(&self, client_url: &str) -> Result<()> {
        if self.unreachable.iter().any(|h| client_url.contains(h.as_str())) {
            Err(Error::http(client_url, "connection refused"))
        } else {
            Ok(())
        }
    }

    async fn member_remove(&self, id: u64) -> Result<()> {
        self.members.lock().retain(|m| m.id != id);
        self.removed.lock().push(id);
        Ok(())
    }
}

/// Hands out the same [`FakeEtcd`] every time
pub struct FakeEtcdProvider(pub Arc<FakeEtcd>);

#[async_trait]
impl EtcdProvider for FakeEtcdProvider {
    async fn connect(&self, _leader: keel_executor::Runner) -> Result<Arc<dyn EtcdApi>> {
        Ok(self.0.clone())
    }
}

/// In-memory Node objects
#[derive(Default)]
pub struct FakeClusterApi {
    pub nodes: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeClusterApi {
    pub fn with_nodes(nodes: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(nodes.iter().map(|s| s.to_string()).collect()),
            deleted: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn node_names(&self) -> Result<Vec<String>> {
        Ok(self.nodes.lock().clone())
    }

    async fn control_plane_node_names(&self) -> Result<Vec<String>> {
        Ok(self
            .nodes
            .lock()
            .iter()
            .filter(|n| n.starts_with("cp-") || n.starts_with("old"))
            .cloned()
            .collect())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.nodes.lock().retain(|n| n != name);
        self.deleted.lock().push(name.to_string());
        Ok(())
    }

    async fn external_ccm_deployed(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Hands out the same [`FakeClusterApi`] every time
pub struct FakeClusterApiProvider(pub Arc<FakeClusterApi>);

#[async_trait]
impl ClusterApiProvider for FakeClusterApiProvider {
    async fn connect(
        &self,
        _leader: Arc<dyn Connection>,
        _kubeconfig: Vec<u8>,
        _cancel: CancellationToken,
    ) -> Result<Arc<dyn ClusterApi>> {
        Ok(self.0.clone())
    }
}

/// Rules making every host look like a provisioned kubeadm node at `version`
pub fn provisioned_hosts(adapter: &Arc<ScriptedAdapter>, version: &str) -> Arc<ScriptedAdapter> {
    let running = "LoadState=loaded\nActiveState=active\nSubState=running\n";
    adapter
        .on("-p LoadState,ActiveState,SubState", Reply::ok(running))
        .on(
            "systemctl show kubelet -p ExecStart",
            Reply::ok("{ path=/usr/bin/kubelet ; argv[]=/usr/bin/kubelet ; }"),
        )
        .on(
            "systemctl show containerd -p ExecStart",
            Reply::ok("{ path=/usr/bin/containerd ; argv[]=/usr/bin/containerd ; }"),
        )
        .on(
            "/usr/bin/kubelet --version",
            Reply::ok(format!("Kubernetes v{}\n", version)),
        )
        .on(
            "/usr/bin/containerd --version",
            Reply::ok("containerd github.com/containerd/containerd v1.7.13 7c3aca7\n"),
        )
        .on("test -f /etc/kubernetes/kubelet.conf", Reply::ok(""))
        .on("openssl x509", Reply::ok("notAfter=Jan  1 00:00:00 2035 GMT\n"))
        .on("encryption-providers.yaml", Reply::fail(1))
        .on("kube-controller-manager.yaml", Reply::fail(1))
        .on("admin.conf", Reply::ok("apiVersion: v1\nkind: Config\n"))
}

/// Rules making every host look freshly booted
pub fn fresh_hosts(adapter: &Arc<ScriptedAdapter>) -> Arc<ScriptedAdapter> {
    adapter
        .on(
            "-p LoadState,ActiveState,SubState",
            Reply::ok("LoadState=not-found\nActiveState=inactive\nSubState=dead\n"),
        )
        .on("test -f /etc/kubernetes/kubelet.conf", Reply::fail(1))
}

/// Fakes behind every collaborator reached through the leader
pub fn fake_backends(
    healthy_api_servers: &[&str],
    etcd: &Arc<FakeEtcd>,
    api: &Arc<FakeClusterApi>,
) -> Backends {
    Backends {
        api_server: Arc::new(FakeApiServers {
            healthy: healthy_api_servers.iter().map(|s| s.to_string()).collect(),
            version: "1.29.3",
        }),
        etcd: Arc::new(FakeEtcdProvider(etcd.clone())),
        cluster_api: Arc::new(FakeClusterApiProvider(api.clone())),
    }
}

/// Rules answering the join material requests on the leader
pub fn join_material(adapter: &Arc<ScriptedAdapter>) -> Arc<ScriptedAdapter> {
    adapter
        .on(
            "token create --print-join-command",
            Reply::ok("kubeadm join 192.168.0.10:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash sha256:00ff\n"),
        )
        .on("init phase upload-certs", Reply::ok("0123abcd\n"))
}
