//! Discovery, host probing and cluster investigation on scripted hosts

use chrono::{TimeZone, Utc};
use semver::Version;

use keel::probe::{discover_hosts, probe_hosts};
use keel::tasks::plans;
use keel::{Backends, Error};
use keel_cluster::OperatingSystem;

use super::helpers::{
    cluster_config, fake_backends, fast_options, fresh_hosts, provisioned_hosts, state_with,
    FakeClusterApi, FakeEtcd, Reply, ScriptedAdapter,
};

#[tokio::test]
async fn discovery_fills_in_what_the_manifest_left_out() {
    let adapter = ScriptedAdapter::new()
        .on("hostname -f", Reply::ok("cp-0.internal\n"))
        .on("os-release", Reply::ok("flatcar\n"));
    let mut config = cluster_config(2, 0);
    config.control_plane.hosts[0].hostname.clear();
    config.control_plane.hosts[0].operating_system = OperatingSystem::Unknown;
    let state = state_with(config, adapter.clone(), Backends::default(), fast_options());

    discover_hosts(state.clone()).await.unwrap();

    let config = state.config.read().clone();
    assert_eq!(config.control_plane.hosts[0].hostname, "cp-0.internal");
    assert_eq!(
        config.control_plane.hosts[0].operating_system,
        OperatingSystem::Flatcar
    );
    // the live records see the discovered values too
    assert_eq!(state.live.lock().control_plane[0].name(), "cp-0.internal");

    // hosts with a complete manifest entry are left alone
    assert_eq!(
        adapter.hosts_that_ran("hostname -f"),
        ["10.0.0.10".to_string()].into_iter().collect()
    );
}

#[tokio::test]
async fn probe_reads_versions_and_certificates() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let state = state_with(
        cluster_config(1, 1),
        adapter,
        Backends::default(),
        fast_options(),
    );

    probe_hosts(state.clone()).await.unwrap();

    let live = state.live.lock();
    let cp = &live.control_plane[0];
    assert!(cp.is_provisioned());
    assert_eq!(cp.kubelet.version, Some(Version::new(1, 29, 3)));
    assert_eq!(cp.containerd.version, Some(Version::new(1, 7, 13)));
    assert_eq!(
        cp.earliest_cert_expiry,
        Some(Utc.with_ymd_and_hms(2035, 1, 1, 0, 0, 0).unwrap())
    );

    // only control-plane hosts carry certificates worth renewing
    let worker = &live.static_workers[0];
    assert!(worker.is_provisioned());
    assert_eq!(worker.earliest_cert_expiry, None);

    assert!(live.is_provisioned());
    assert!(!live.certs_to_expire_in_less_than_90_days());
}

#[tokio::test]
async fn image_based_hosts_use_the_fixed_binary_directory() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3").on_host(
        "cp-0",
        "/opt/bin/kubelet --version",
        Reply::ok("Kubernetes v1.28.9\n"),
    );
    let mut config = cluster_config(1, 0);
    config.control_plane.hosts[0].operating_system = OperatingSystem::Flatcar;
    let state = state_with(config, adapter.clone(), Backends::default(), fast_options());

    probe_hosts(state.clone()).await.unwrap();

    assert_eq!(
        state.live.lock().control_plane[0].kubelet.version,
        Some(Version::new(1, 28, 9))
    );
    assert!(adapter
        .hosts_that_ran("systemctl show kubelet -p ExecStart")
        .is_empty());
    // containerd ships with the image, so its path still comes from systemd
    assert_eq!(
        state.live.lock().control_plane[0].containerd.version,
        Some(Version::new(1, 7, 13))
    );
}

#[tokio::test]
async fn fresh_hosts_plan_a_full_install() {
    let adapter = fresh_hosts(&ScriptedAdapter::new());
    let state = state_with(
        cluster_config(3, 1),
        adapter.clone(),
        Backends::default(),
        fast_options(),
    );

    plans::probe_tasks().run(&state).await.unwrap();
    assert!(!state.live.lock().is_provisioned());

    let planned = plans::install_tasks().descriptions(&state);
    assert!(planned.contains(&"install container runtime, kubeadm and kubelet".to_string()));
    assert!(planned.contains(&"run kubeadm init on the leader".to_string()));
    assert!(!planned.contains(&"elect leader, map etcd and node membership".to_string()));

    // unit state was read, but no version probe ran on a missing unit
    assert!(adapter.hosts_that_ran("--version").is_empty());
}

#[tokio::test]
async fn investigation_elects_leader_and_maps_membership() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0", "cp-1", "cp-2"], &["cp-0"]);
    let api = FakeClusterApi::with_nodes(&["cp-0", "cp-1", "cp-2", "w-0"]);
    let state = state_with(
        cluster_config(3, 1),
        adapter,
        fake_backends(&["cp-1", "cp-2"], &etcd, &api),
        fast_options(),
    );

    plans::probe_tasks().run(&state).await.unwrap();

    assert_eq!(state.leader().unwrap().name(), "cp-1");
    assert!(state.has_cluster_api());
    assert_eq!(
        state.kubeconfig().as_deref(),
        Some(&b"apiVersion: v1\nkind: Config\n"[..])
    );

    let live = state.live.lock();
    assert_eq!(live.leader().map(|h| h.name()), Some("cp-1"));
    assert_eq!(
        live.control_plane[1].kubeconfig.as_deref(),
        Some(&b"apiVersion: v1\nkind: Config\n"[..])
    );

    let etcd_healthy: Vec<bool> = live.control_plane.iter().map(|h| h.etcd.healthy()).collect();
    assert_eq!(etcd_healthy, vec![false, true, true]);
    assert_eq!(live.healthy_etcd_members(), 2);
    assert!(live.hosts().all(|h| h.is_in_cluster));

    // cp-0 has neither API server nor etcd, which is safe to remove
    assert_eq!(live.broken_hosts(), vec!["cp-0"]);
    assert_eq!(live.safe_to_delete_hosts(), vec!["cp-0"]);

    assert!(!live.encryption.as_ref().unwrap().enabled);
    // the controller-manager manifest was unreadable
    assert!(live.ccm.is_none());
}

#[tokio::test]
async fn hosts_missing_from_the_node_list_are_not_members() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0"], &[]);
    let api = FakeClusterApi::with_nodes(&["cp-0"]);
    let state = state_with(
        cluster_config(1, 2),
        adapter,
        fake_backends(&["cp-0"], &etcd, &api),
        fast_options(),
    );

    plans::probe_tasks().run(&state).await.unwrap();

    let live = state.live.lock();
    assert!(live.control_plane[0].is_in_cluster);
    assert!(live.static_workers.iter().all(|h| !h.is_in_cluster));
    // non-members are joined, not repaired
    assert!(live.broken_hosts().is_empty());
}

#[tokio::test]
async fn no_healthy_api_server_needs_manual_intervention() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0", "cp-1", "cp-2"], &[]);
    let api = FakeClusterApi::with_nodes(&["cp-0", "cp-1", "cp-2"]);
    let state = state_with(
        cluster_config(3, 0),
        adapter,
        fake_backends(&[], &etcd, &api),
        fast_options(),
    );

    let err = plans::probe_tasks().run(&state).await.unwrap_err();
    assert_eq!(err.operation(), Some("investigate cluster"));
    assert!(matches!(
        err,
        Error::Operation { ref source, .. } if matches!(**source, Error::ManualIntervention { .. })
    ));
    assert!(!state.has_cluster_api());
}
