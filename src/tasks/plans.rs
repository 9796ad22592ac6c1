//! Command plans
//!
//! Every `keel` subcommand is a fixed task list built from the same probing
//! prefix, so each predicate is evaluated against a freshly probed cluster.

use std::fmt::Write as _;

use semver::Version;
use tracing::{info, warn};

use keel_cluster::{quorum, ComponentState, HostConfig, LiveCluster};
use keel_common::{Error, Result, DEFAULT_APISERVER_PORT};

use super::nodes::{
    run_task_on_all_nodes, run_task_on_control_plane, run_task_on_followers,
    run_task_on_leader, run_task_on_nodes, run_task_on_static_workers, Mode,
};
use super::{Task, Tasks};
use crate::probe::{discover_hosts, fallback_leader, investigate_cluster, probe_hosts};
use crate::reconcile::reconcile_etcd;
use crate::scripts::{
    prerequisites_script, upgrade_kubeadm_script, upgrade_kubelet_script, Script,
};
use crate::state::State;
use crate::upgrade::{validate_upgrade, SkewVerdict};

fn provisioned(state: &State) -> bool {
    state.live.lock().is_provisioned()
}

fn fresh_install(state: &State) -> bool {
    !provisioned(state) || state.options.force_install
}

fn missing_followers(state: &State) -> bool {
    let live = state.live.lock();
    live.control_plane
        .iter()
        .any(|h| !h.config.is_leader && !h.is_in_cluster)
}

fn missing_workers(state: &State) -> bool {
    state
        .live
        .lock()
        .static_workers
        .iter()
        .any(|h| !h.is_in_cluster)
}

fn unprovisioned_hosts(state: &State) -> bool {
    state.live.lock().hosts().any(|h| !h.is_provisioned())
}

fn broken_hosts(state: &State) -> bool {
    !state.live.lock().broken_hosts().is_empty()
}

fn certs_expiring(state: &State) -> bool {
    state.live.lock().certs_to_expire_in_less_than_90_days()
}

fn destroy_workers(state: &State) -> bool {
    state.options.destroy_workers
}

/// Sleep for the stabilisation pause unless the run is cancelled
pub async fn pause(state: &State) -> Result<()> {
    if state.options.stabilize.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = state.cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(state.options.stabilize) => Ok(()),
    }
}

fn is_in_cluster(state: &State, host: &HostConfig) -> bool {
    state
        .live
        .lock()
        .hosts()
        .any(|h| h.config.id == host.id && h.is_in_cluster)
}

fn host_provisioned(state: &State, host: &HostConfig) -> bool {
    state
        .live
        .lock()
        .hosts()
        .any(|h| h.config.id == host.id && h.is_provisioned())
}

fn kubelet_version(state: &State, host: &HostConfig) -> Option<Version> {
    state
        .live
        .lock()
        .hosts()
        .find(|h| h.config.id == host.id)
        .and_then(|h| h.kubelet.version.clone())
}

/// Version new hosts are installed with
///
/// On a running cluster a target older than the control plane is raised to
/// the highest version already running there.
pub fn install_version(state: &State) -> Result<Version> {
    let target = state.target_version()?;
    let repair = state.live.lock().safe_to_repair(&target);
    if !repair.safe {
        warn!(
            requested = %target,
            effective = %repair.version,
            "requested version is older than the running control plane"
        );
    }
    Ok(repair.version)
}

/// Address the control-plane endpoint is advertised on
fn api_endpoint(host: &HostConfig) -> String {
    let address = if host.private_address.is_empty() {
        &host.public_address
    } else {
        &host.private_address
    };
    format!("{}:{}", address, DEFAULT_APISERVER_PORT)
}

async fn install_prerequisites(state: State, host: HostConfig) -> Result<()> {
    if host_provisioned(&state, &host) && !state.options.force_install {
        info!(host = %host.name(), "prerequisites already installed");
        return Ok(());
    }
    let version = install_version(&state)?;
    let docker = state.config.read().container_runtime.docker;
    let script = prerequisites_script(host.operating_system)?;
    let command = state.script(script, host.name(), |p| {
        p.with("version", &version)
            .with("minor", format!("{}.{}", version.major, version.minor))
            .flag("docker", docker)
    })?;
    state.runner()?.run_raw(&command).await?;
    info!(host = %host.name(), version = %version, "installed prerequisites");
    Ok(())
}

async fn install_prerequisites_on_all(state: State) -> Result<()> {
    run_task_on_all_nodes(&state, install_prerequisites, Mode::Parallel).await
}

async fn init_host(state: State, host: HostConfig) -> Result<()> {
    let initialized = state
        .live
        .lock()
        .hosts()
        .any(|h| h.config.id == host.id && h.kubelet_initialized());
    if initialized && !state.options.force_install {
        info!(host = %host.name(), "control plane already initialized");
        return Ok(());
    }
    let version = install_version(&state)?;
    let command = state.script(Script::KubeadmInit, host.name(), |p| {
        p.with("version", &version).with("endpoint", api_endpoint(&host))
    })?;
    state.runner()?.run_raw(&command).await?;
    info!(host = %host.name(), version = %version, "initialized control plane");
    Ok(())
}

async fn init_control_plane(state: State) -> Result<()> {
    run_task_on_leader(&state, init_host).await
}

/// What a host needs from the leader to join
#[derive(Debug, Clone)]
struct JoinMaterial {
    command: String,
    certificate_key: Option<String>,
}

async fn join_material(state: &State, control_plane: bool) -> Result<JoinMaterial> {
    let leader = state.for_host(&state.leader()?).await?;
    let runner = leader.runner()?;

    let script = state.script(Script::KubeadmJoinCommand, runner.host(), |p| p)?;
    let command = runner.run_raw(&script).await?.stdout.trim().to_string();
    if command.is_empty() {
        return Err(Error::internal_with_context(
            "join",
            "leader printed an empty join command",
        ));
    }

    let certificate_key = if control_plane {
        let script = state.script(Script::KubeadmCertificateKey, runner.host(), |p| p)?;
        Some(runner.run_raw(&script).await?.stdout.trim().to_string())
    } else {
        None
    };

    Ok(JoinMaterial {
        command,
        certificate_key,
    })
}

async fn join_host(state: State, host: HostConfig, material: JoinMaterial) -> Result<()> {
    if is_in_cluster(&state, &host) {
        return Ok(());
    }
    let command = match &material.certificate_key {
        Some(key) => state.script(Script::KubeadmJoinControlPlane, host.name(), |p| {
            p.with("join_command", &material.command)
                .with("certificate_key", key)
        })?,
        None => state.script(Script::KubeadmJoinWorker, host.name(), |p| {
            p.with("join_command", &material.command)
        })?,
    };
    state.runner()?.run_raw(&command).await?;
    info!(
        host = %host.name(),
        control_plane = material.certificate_key.is_some(),
        "joined cluster"
    );
    Ok(())
}

async fn join_followers(state: State) -> Result<()> {
    let material = join_material(&state, true).await?;
    // etcd grows one member at a time
    run_task_on_followers(
        &state,
        move |s, h| join_host(s, h, material.clone()),
        Mode::Sequential,
    )
    .await
}

async fn join_workers(state: State) -> Result<()> {
    let material = join_material(&state, false).await?;
    run_task_on_static_workers(
        &state,
        move |s, h| join_host(s, h, material.clone()),
        Mode::Parallel,
    )
    .await
}

async fn renew_host_certificates(state: State, host: HostConfig) -> Result<()> {
    let command = state.script(Script::RenewCertificates, host.name(), |p| p)?;
    state.runner()?.run_raw(&command).await?;
    info!(host = %host.name(), "renewed certificates");
    pause(&state).await
}

async fn renew_certificates(state: State) -> Result<()> {
    run_task_on_control_plane(&state, renew_host_certificates, Mode::Sequential).await
}

async fn validate_skew(state: State) -> Result<()> {
    if !provisioned(&state) {
        return Err(Error::validation(
            "cluster is not provisioned, run install first",
        ));
    }
    let target = state.target_version()?.to_string();
    let verdict = {
        let live = state.live.lock();
        validate_upgrade(&target, &live, state.options.force_upgrade)?
    };
    match verdict {
        SkewVerdict::Allowed => info!(target_version = %target, "version skew within policy"),
        SkewVerdict::Warned(problems) => warn!(
            target_version = %target,
            violations = problems.len(),
            "proceeding despite version skew"
        ),
    }
    Ok(())
}

async fn upgrade_host(state: State, host: HostConfig, first: bool) -> Result<()> {
    let target = state.target_version()?;
    if kubelet_version(&state, &host).as_ref() == Some(&target) && !state.options.force_upgrade {
        info!(host = %host.name(), version = %target, "already upgraded");
        return Ok(());
    }

    let leader = state.for_host(&state.leader()?).await?;
    let leader = leader.runner()?;
    let runner = state.runner()?;

    let drain = state.script(Script::DrainNode, host.name(), |p| p)?;
    leader.run_raw(&drain).await?;

    let kubeadm_package =
        state.script(upgrade_kubeadm_script(host.operating_system)?, host.name(), |p| {
            p.with("version", &target)
        })?;
    runner.run_raw(&kubeadm_package).await?;

    let kubeadm = if first {
        state.script(Script::KubeadmUpgradeApply, host.name(), |p| {
            p.with("version", &target)
        })?
    } else {
        state.script(Script::KubeadmUpgradeNode, host.name(), |p| p)?
    };
    runner.run_raw(&kubeadm).await?;

    // kubelet never runs ahead of the API server it talks to
    let kubelet = state.script(upgrade_kubelet_script(host.operating_system)?, host.name(), |p| {
        p.with("version", &target)
    })?;
    runner.run_raw(&kubelet).await?;

    let uncordon = state.script(Script::UncordonNode, host.name(), |p| p)?;
    leader.run_raw(&uncordon).await?;

    info!(host = %host.name(), version = %target, "upgraded host");
    pause(&state).await
}

async fn upgrade_leader(state: State) -> Result<()> {
    run_task_on_leader(&state, |s, h| upgrade_host(s, h, true)).await
}

async fn upgrade_followers(state: State) -> Result<()> {
    run_task_on_followers(&state, |s, h| upgrade_host(s, h, false), Mode::Sequential).await
}

async fn upgrade_workers(state: State) -> Result<()> {
    run_task_on_static_workers(&state, |s, h| upgrade_host(s, h, false), Mode::Sequential).await
}

async fn reset_host(state: State, host: HostConfig) -> Result<()> {
    let command = state.script(Script::KubeadmReset, host.name(), |p| p)?;
    state.runner()?.run_raw(&command).await?;
    info!(host = %host.name(), "reset host");
    Ok(())
}

async fn reset_control_plane(state: State) -> Result<()> {
    run_task_on_control_plane(&state, reset_host, Mode::Parallel).await
}

async fn reset_static_workers(state: State) -> Result<()> {
    run_task_on_static_workers(&state, reset_host, Mode::Parallel).await
}

/// Refuse to repair when more control-plane hosts are broken than can be
/// removed without losing etcd quorum
pub async fn guard_broken_hosts(state: State) -> Result<()> {
    check_broken_hosts(&state.live.lock())
}

/// See [`guard_broken_hosts`]
pub fn check_broken_hosts(live: &LiveCluster) -> Result<()> {
    let members = live.control_plane.iter().filter(|h| h.is_in_cluster).count();
    if members > 0 && live.healthy_etcd_members() < quorum(members) {
        return Err(Error::manual_intervention(format!(
            "only {} of {} control-plane members run a healthy etcd, quorum is lost",
            live.healthy_etcd_members(),
            members
        )));
    }

    let safe = live.safe_to_delete_hosts();
    let broken: Vec<&str> = live
        .control_plane
        .iter()
        .filter(|h| h.is_in_cluster && !h.control_plane_healthy())
        .map(|h| h.name())
        .collect();

    if let Some(leader) = live.leader() {
        if broken.contains(&leader.name()) {
            return Err(Error::manual_intervention(format!(
                "leader {} is broken",
                leader.name()
            )));
        }
    }

    let unsafe_to_remove: Vec<&str> = broken
        .into_iter()
        .filter(|name| !safe.iter().any(|s| s == name))
        .collect();
    if !unsafe_to_remove.is_empty() {
        return Err(Error::manual_intervention(format!(
            "removing broken control-plane hosts [{}] would lose etcd quorum",
            unsafe_to_remove.join(", ")
        )));
    }
    Ok(())
}

async fn reset_broken_host(state: State, host: HostConfig) -> Result<()> {
    reset_host(state.clone(), host.clone()).await?;
    state.cluster_api()?.delete_node(host.name()).await?;

    let mut guard = state.live.lock();
    let live = &mut *guard;
    if let Some(record) = live
        .control_plane
        .iter_mut()
        .chain(live.static_workers.iter_mut())
        .find(|h| h.config.id == host.id)
    {
        record.is_in_cluster = false;
        record.kubelet.state.remove(ComponentState::KUBELET_INITIALIZED);
    }
    Ok(())
}

async fn reset_broken_hosts(state: State) -> Result<()> {
    let hosts = state.live.lock().broken_host_configs();
    run_task_on_nodes(&state, hosts, reset_broken_host, Mode::Sequential).await
}

/// Discovery, probing and investigation
pub fn probe_tasks() -> Tasks {
    Tasks::from(vec![
        Task::new("discover hosts", discover_hosts)
            .describe("discover hostnames and operating systems"),
        Task::new("probe hosts", probe_hosts)
            .describe("probe container runtimes and kubelet on every host"),
        Task::new("investigate cluster", investigate_cluster)
            .describe("elect leader, map etcd and node membership")
            .when(provisioned),
    ])
}

/// `keel status`
pub fn status_tasks() -> Tasks {
    probe_tasks()
}

fn bootstrap_tasks() -> Tasks {
    Tasks::from(vec![
        Task::new("designate leader", fallback_leader)
            .describe("designate the first control-plane host as leader")
            .when(|s| !provisioned(s)),
        Task::new("install prerequisites", install_prerequisites_on_all)
            .describe("install container runtime, kubeadm and kubelet")
            .when(fresh_install),
        Task::new("initialize control plane", init_control_plane)
            .describe("run kubeadm init on the leader")
            .when(fresh_install)
            .retries(1),
    ])
}

/// `keel install`
pub fn install_tasks() -> Tasks {
    probe_tasks().append(bootstrap_tasks()).append(Tasks::from(vec![
        Task::new("join control plane", join_followers)
            .describe("join the remaining control-plane hosts one by one")
            .when(fresh_install),
        Task::new("join static workers", join_workers)
            .describe("join static workers")
            .when(fresh_install),
    ]))
}

/// `keel upgrade`
pub fn upgrade_tasks() -> Tasks {
    probe_tasks().append(Tasks::from(vec![
        Task::new("validate version skew", validate_skew)
            .describe("check the target version against the skew policy")
            .retries(1),
        Task::new("upgrade leader", upgrade_leader)
            .describe("upgrade the leader with kubeadm upgrade apply"),
        Task::new("upgrade control plane", upgrade_followers)
            .describe("upgrade the remaining control-plane hosts one by one"),
        Task::new("upgrade static workers", upgrade_workers)
            .describe("upgrade static workers one by one"),
    ]))
}

/// `keel reset`
pub fn reset_tasks() -> Tasks {
    Tasks::from(vec![
        Task::new("discover hosts", discover_hosts)
            .describe("discover hostnames and operating systems"),
        Task::new("reset static workers", reset_static_workers)
            .describe("kubeadm reset on static workers")
            .when(destroy_workers)
            .retries(3),
        Task::new("reset control plane", reset_control_plane)
            .describe("kubeadm reset on every control-plane host")
            .retries(3),
    ])
}

/// Steps of `keel apply` after probing
pub fn repair_tasks() -> Tasks {
    bootstrap_tasks()
        .prepend(Tasks::from(vec![
            Task::new("check broken hosts", guard_broken_hosts)
                .describe("verify broken hosts can be removed without losing quorum")
                .when(provisioned)
                .retries(1),
            Task::new("reset broken hosts", reset_broken_hosts)
                .describe("reset broken hosts and delete their nodes")
                .when(broken_hosts),
            Task::new("reconcile etcd membership", reconcile_etcd)
                .describe("remove unknown and unreachable etcd members")
                .when(provisioned),
        ]))
        .append(Tasks::from(vec![
            Task::new("install prerequisites on new hosts", install_prerequisites_on_all)
                .describe("install prerequisites on hosts that lack them")
                .when(|s| provisioned(s) && unprovisioned_hosts(s)),
            Task::new("join control plane", join_followers)
                .describe("join missing control-plane hosts one by one")
                .when(missing_followers),
            Task::new("join static workers", join_workers)
                .describe("join missing static workers")
                .when(missing_workers),
            Task::new("renew certificates", renew_certificates)
                .describe("renew control-plane certificates expiring within 90 days")
                .when(certs_expiring),
        ]))
}

/// `keel apply`
pub fn apply_tasks() -> Tasks {
    probe_tasks().append(repair_tasks())
}

/// Human readable summary of the live cluster
pub fn status_report(live: &LiveCluster) -> String {
    fn version(v: &Option<Version>) -> String {
        v.as_ref().map(Version::to_string).unwrap_or_else(|| "-".into())
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<24} {:<14} {:<10} {:<10} {:<6} {:<6} {:<8}",
        "HOST", "ROLE", "KUBELET", "RUNTIME", "API", "ETCD", "MEMBER"
    );
    let roles = live
        .control_plane
        .iter()
        .map(|h| (h, if h.config.is_leader { "leader" } else { "control-plane" }))
        .chain(live.static_workers.iter().map(|h| (h, "worker")));
    for (host, role) in roles {
        let is_control_plane = role != "worker";
        let _ = writeln!(
            out,
            "{:<24} {:<14} {:<10} {:<10} {:<6} {:<6} {:<8}",
            host.name(),
            role,
            version(&host.kubelet.version),
            if host.container_runtime_healthy() { "ok" } else { "down" },
            if !is_control_plane { "-" } else if host.api_server.healthy() { "ok" } else { "down" },
            if !is_control_plane { "-" } else if host.etcd.healthy() { "ok" } else { "down" },
            if host.is_in_cluster { "yes" } else { "no" },
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "provisioned:      {}", live.is_provisioned());
    let _ = writeln!(out, "healthy:          {}", live.healthy());
    let _ = writeln!(
        out,
        "etcd tolerance:   {} of {} healthy members",
        live.etcd_tolerance_remain(),
        live.healthy_etcd_members()
    );
    let broken = live.broken_hosts();
    if !broken.is_empty() {
        let _ = writeln!(out, "broken hosts:     {}", broken.join(", "));
    }
    if live.certs_to_expire_in_less_than_90_days() {
        let _ = writeln!(out, "certificates expire within 90 days");
    }
    if let Some(ccm) = &live.ccm {
        if ccm.migration_eligible() {
            let _ = writeln!(out, "eligible for external cloud-controller-manager migration");
        }
    }
    out
}
