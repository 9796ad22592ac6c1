//! Node prober and cluster investigation
//!
//! Hosts are probed in parallel; each probe builds a complete [`Host`] record
//! and swaps it into the live cluster under the lock. Once every host is
//! probed, the cluster-wide pass elects the leader and overlays API server,
//! etcd and membership health on top of the per-host records.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use semver::Version;
use tracing::{debug, info, warn};

use keel_cluster::{
    find_version, CcmStatus, ComponentState, ComponentStatus, ContainerStatus,
    EncryptionConfiguration, Host, HostConfig, OperatingSystem,
};
use keel_common::{Error, Result};
use keel_executor::Runner;

use crate::etcd::EtcdApi;
use crate::health::ApiServerHealth;
use crate::scripts::Script;
use crate::state::State;
use crate::tasks::nodes::{run_task_on_all_nodes, Mode};

/// Directory image based systems install the kubelet to
pub const IMAGE_BASED_BIN_DIR: &str = "/opt/bin";

/// Parse `systemctl show -p LoadState,ActiveState,SubState` output
pub fn parse_unit_state(output: &str) -> ComponentState {
    let mut load = "";
    let mut active = "";
    let mut sub = "";
    for line in output.lines() {
        match line.trim().split_once('=') {
            Some(("LoadState", v)) => load = v,
            Some(("ActiveState", v)) => active = v,
            Some(("SubState", v)) => sub = v,
            _ => {}
        }
    }
    ComponentState::from_systemd(load, active, sub)
}

/// Executable path from `systemctl show -p ExecStart --value`
///
/// The value looks like `{ path=/usr/bin/kubelet ; argv[]=/usr/bin/kubelet ... }`.
pub fn parse_exec_path(output: &str) -> Option<String> {
    output
        .split([' ', ';', '{', '}'])
        .find_map(|token| token.strip_prefix("path="))
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

/// Earliest date among `notAfter=` lines printed by openssl
pub fn parse_earliest_expiry(output: &str) -> Option<DateTime<Utc>> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("notAfter="))
        .filter_map(|raw| {
            let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT").ok()
        })
        .map(|naive| naive.and_utc())
        .min()
}

async fn unit_state(state: &State, runner: &Runner, unit: &str) -> Result<ComponentState> {
    let command = state.script(Script::UnitStatus, runner.host(), |p| p.with("unit", unit))?;
    let out = runner.output(&command).await?;
    Ok(parse_unit_state(&out.stdout))
}

async fn binary_path(
    state: &State,
    runner: &Runner,
    unit: &str,
    os: OperatingSystem,
) -> Result<Option<String>> {
    // containerd ships with the image; only the kubelet lives in /opt/bin
    if unit == "kubelet" && os.is_image_based() {
        return Ok(Some(format!("{}/{}", IMAGE_BASED_BIN_DIR, unit)));
    }
    let command = state.script(Script::UnitExecStart, runner.host(), |p| {
        p.with("unit", unit)
    })?;
    let out = runner.output(&command).await?;
    Ok(parse_exec_path(&out.stdout))
}

async fn binary_version(state: &State, runner: &Runner, path: &str) -> Result<Option<Version>> {
    let command = state.script(Script::BinaryVersion, runner.host(), |p| p.with("path", path))?;
    let out = runner.output(&command).await?;
    if !out.success() {
        return Ok(None);
    }
    Ok(find_version(&out.stdout))
}

async fn component_status(
    state: &State,
    runner: &Runner,
    unit: &str,
    os: OperatingSystem,
) -> Result<ComponentStatus> {
    let unit_state = unit_state(state, runner, unit).await?;
    let version = if unit_state.contains(ComponentState::INSTALLED) {
        match binary_path(state, runner, unit, os).await? {
            Some(path) => binary_version(state, runner, &path).await?,
            None => None,
        }
    } else {
        None
    };
    Ok(ComponentStatus {
        version,
        state: unit_state,
    })
}

async fn docker_status(state: &State, runner: &Runner) -> Result<ComponentStatus> {
    let unit_state = unit_state(state, runner, "docker").await?;
    let command = state.script(Script::DockerVersion, runner.host(), |p| p)?;
    let out = runner.output(&command).await?;
    let version = if out.success() {
        find_version(&out.stdout)
    } else {
        None
    };
    Ok(ComponentStatus {
        version,
        state: unit_state,
    })
}

async fn earliest_cert_expiry(state: &State, runner: &Runner) -> Result<Option<DateTime<Utc>>> {
    let command = state.script(Script::CertExpiry, runner.host(), |p| p)?;
    let out = runner.output(&command).await?;
    Ok(parse_earliest_expiry(&out.stdout))
}

/// Probe one host and replace its live record
pub async fn probe_host(state: State, host: HostConfig) -> Result<()> {
    let runner = state.runner()?;
    let os = host.operating_system;
    let runtime = state.config.read().container_runtime;
    let is_control_plane = state
        .config
        .read()
        .control_plane
        .hosts
        .iter()
        .any(|h| h.id == host.id);

    let mut record = Host::new(host.clone(), runtime);
    record.containerd = component_status(&state, runner, "containerd", os).await?;
    if runtime.docker {
        record.docker = docker_status(&state, runner).await?;
    }
    record.kubelet = component_status(&state, runner, "kubelet", os).await?;

    let command = state.script(Script::KubeletInitialized, runner.host(), |p| p)?;
    if runner.output(&command).await?.success() {
        record.kubelet.state |= ComponentState::KUBELET_INITIALIZED;
    }

    if is_control_plane && record.kubelet_initialized() {
        record.earliest_cert_expiry = earliest_cert_expiry(&state, runner).await?;
    }

    debug!(
        host = %host.name(),
        containerd = ?record.containerd.state,
        kubelet = ?record.kubelet.state,
        kubelet_version = ?record.kubelet.version,
        "probed host"
    );

    // the previous pass' membership stays until investigation recomputes it
    let mut live = state.live.lock();
    if let Some(previous) = live.hosts().find(|h| h.config.id == host.id) {
        record.is_in_cluster = previous.is_in_cluster;
    }
    if !live.replace_host(record) {
        warn!(host = %host.name(), "probed host is not part of the live cluster");
    }
    Ok(())
}

/// Probe every configured host in parallel
pub async fn probe_hosts(state: State) -> Result<()> {
    let result = run_task_on_all_nodes(&state, probe_host, Mode::Parallel).await;
    let config = state.config_snapshot();
    state.live.lock().sync_configs(&config);
    result
}

/// Fill in hostname and operating system where the manifest left them out
pub async fn discover_host(state: State, host: HostConfig) -> Result<()> {
    let runner = state.runner()?;
    let mut hostname = host.hostname.clone();
    let mut os = host.operating_system;

    if hostname.is_empty() {
        let command = state.script(Script::Hostname, runner.host(), |p| p)?;
        hostname = runner.run_raw(&command).await?.stdout.trim().to_string();
    }
    if os == OperatingSystem::Unknown {
        let command = state.script(Script::OsRelease, runner.host(), |p| p)?;
        os = OperatingSystem::from_os_release_id(&runner.run_raw(&command).await?.stdout);
    }

    if let Some(entry) = state.config.write().host_mut(host.id) {
        entry.hostname = hostname.clone();
        entry.operating_system = os;
    }
    debug!(host = %hostname, os = ?os, "discovered host");
    Ok(())
}

/// Discover every host in parallel
pub async fn discover_hosts(state: State) -> Result<()> {
    run_task_on_all_nodes(&state, discover_host, Mode::Parallel).await?;
    let config = state.config_snapshot();
    state.live.lock().sync_configs(&config);
    Ok(())
}

/// Designate the first control-plane host as leader when none is marked
///
/// Only for clusters that are not provisioned yet; a running cluster elects
/// its leader from API server health.
pub async fn fallback_leader(state: State) -> Result<()> {
    let first = {
        let config = state.config.read();
        if config.leader().is_some() {
            return Ok(());
        }
        config.control_plane.hosts.first().map(|h| h.id)
    };
    if let Some(id) = first {
        state.config.write().set_leader(id);
        let config = state.config_snapshot();
        state.live.lock().sync_configs(&config);
        info!(leader = ?config.leader().map(|h| h.name().to_string()), "designated install leader");
    }
    Ok(())
}

async fn probe_api_servers(state: &State) -> Vec<(HostConfig, ApiServerHealth)> {
    let hosts = state.config.read().control_plane.hosts.clone();
    let probes = hosts.into_iter().map(|host| async move {
        let health = match state.connector.connect(&host).await {
            Ok(conn) => state.backends.api_server.probe(conn, &state.cancel).await,
            Err(e) => {
                warn!(host = %host.name(), error = %e, "cannot reach host for api server probe");
                state.drop_connection(&host).await;
                ApiServerHealth::default()
            }
        };
        (host, health)
    });
    join_all(probes).await
}

/// Mark the first healthy API server's host as leader
///
/// No healthy API server on a provisioned cluster means quorum is likely
/// lost; retrying will not fix that.
pub async fn elect_leader(state: &State) -> Result<HostConfig> {
    let results = probe_api_servers(state).await;

    {
        let mut live = state.live.lock();
        for (host, health) in &results {
            if let Some(record) = live.control_plane_host_mut(host.id) {
                record.api_server = if health.healthy {
                    ContainerStatus::running(health.version.clone())
                } else {
                    ContainerStatus::default()
                };
            }
        }
    }

    let leader = results
        .into_iter()
        .find(|(_, health)| health.healthy)
        .map(|(host, _)| host)
        .ok_or_else(|| {
            Error::manual_intervention(
                "no control-plane host has a healthy API server, quorum likely lost",
            )
        })?;

    state.config.write().set_leader(leader.id);
    let config = state.config_snapshot();
    state.live.lock().sync_configs(&config);
    info!(leader = %leader.name(), "elected leader");
    state.leader()
}

/// Map etcd member health onto control-plane hosts
pub async fn map_etcd_health(state: &State, etcd: &dyn EtcdApi) -> Result<()> {
    let members = etcd.member_list().await?;
    let mut healthy: HashMap<String, bool> = HashMap::new();

    for member in &members {
        let mut ok = !member.client_urls.is_empty();
        for url in &member.client_urls {
            if let Err(e) = etcd.member_status(url).await {
                debug!(member = %member.name, url = %url, error = %e, "etcd member status failed");
                ok = false;
                break;
            }
        }
        for identity in member.identities() {
            healthy.insert(identity, ok);
        }
    }

    let mut live = state.live.lock();
    for host in live.control_plane.iter_mut() {
        let ok = host
            .config
            .identities()
            .any(|id| healthy.get(id).copied().unwrap_or(false));
        host.etcd = if ok {
            ContainerStatus::running(None)
        } else {
            ContainerStatus::default()
        };
    }
    Ok(())
}

/// Mark hosts as cluster members by exact Node name match
pub fn mark_membership(state: &State, node_names: &[String]) {
    let mut guard = state.live.lock();
    let live = &mut *guard;
    for host in live
        .control_plane
        .iter_mut()
        .chain(live.static_workers.iter_mut())
    {
        host.is_in_cluster = node_names.iter().any(|n| *n == host.config.hostname);
    }
}

/// CCM/CSI snapshot from the controller-manager manifest and the API
pub fn ccm_status_from_manifest(manifest: &[u8], external_ccm_deployed: bool) -> CcmStatus {
    let mut status = CcmStatus {
        external_ccm_deployed,
        ..Default::default()
    };

    let pod: Pod = match serde_yaml::from_slice(manifest) {
        Ok(pod) => pod,
        Err(e) => {
            warn!(error = %e, "unreadable kube-controller-manager manifest");
            return status;
        }
    };

    let args = pod
        .spec
        .into_iter()
        .flat_map(|spec| spec.containers)
        .flat_map(|c| c.command.unwrap_or_default().into_iter().chain(c.args.unwrap_or_default()));

    for arg in args {
        if let Some(provider) = arg.strip_prefix("--cloud-provider=") {
            if provider == "external" {
                status.in_tree_cloud_provider_unregistered = true;
            } else if !provider.is_empty() {
                status.in_tree_cloud_provider_enabled = true;
            }
        }
        if let Some(gates) = arg.strip_prefix("--feature-gates=") {
            status.csi_migration_enabled |= gates
                .split(',')
                .any(|g| g.starts_with("CSIMigration") && g.ends_with("=true"));
        }
    }
    status
}

async fn fetch_kubeconfig(state: &State, leader: &Runner) -> Result<Vec<u8>> {
    let command = state.script(Script::ReadAdminKubeconfig, leader.host(), |p| p)?;
    leader.capture(&command).await
}

async fn read_encryption(state: &State, leader: &Runner) -> Result<EncryptionConfiguration> {
    let command = state.script(Script::ReadEncryptionConfig, leader.host(), |p| p)?;
    let out = leader.output(&command).await?;
    Ok(if out.success() {
        EncryptionConfiguration {
            enabled: true,
            config: Some(out.stdout),
        }
    } else {
        EncryptionConfiguration::default()
    })
}

async fn read_ccm_status(state: &State, leader: &Runner) -> Result<CcmStatus> {
    let external = state.cluster_api()?.external_ccm_deployed().await?;
    let command = state.script(Script::ReadControllerManagerManifest, leader.host(), |p| p)?;
    let manifest = leader.capture(&command).await?;
    Ok(ccm_status_from_manifest(&manifest, external))
}

/// Cluster-wide investigation, after every host was probed
///
/// Does nothing on clusters that are not provisioned yet.
pub async fn investigate_cluster(state: State) -> Result<()> {
    if !state.live.lock().is_provisioned() {
        debug!("cluster not provisioned, skipping investigation");
        return Ok(());
    }

    let leader = elect_leader(&state).await?;
    let worker = state.for_host(&leader).await?;
    let runner = worker.runner()?.clone();

    let kubeconfig = fetch_kubeconfig(&state, &runner).await?;
    if let Some(record) = state.live.lock().control_plane_host_mut(leader.id) {
        record.kubeconfig = Some(kubeconfig.clone());
    }
    state.set_kubeconfig(kubeconfig.clone());

    let api = state
        .backends
        .cluster_api
        .connect(runner.connection(), kubeconfig, state.cancel.clone())
        .await?;
    state.set_cluster_api(api.clone());

    let etcd = state.backends.etcd.connect(runner.clone()).await?;
    map_etcd_health(&state, etcd.as_ref()).await?;

    let nodes = api.node_names().await?;
    mark_membership(&state, &nodes);

    let encryption = read_encryption(&state, &runner).await?;
    state.live.lock().encryption = Some(encryption);

    match read_ccm_status(&state, &runner).await {
        Ok(ccm) => state.live.lock().ccm = Some(ccm),
        Err(e) => warn!(error = %e, "could not determine cloud provider status"),
    }

    let live = state.live.lock();
    info!(
        leader = %leader.name(),
        healthy = live.healthy(),
        etcd_healthy = live.healthy_etcd_members(),
        broken = ?live.broken_hosts(),
        "cluster investigated"
    );
    Ok(())
}
