//! Install and upgrade plans end to end on scripted hosts

use keel::tasks::plans;
use keel::{Backends, Error, RunOptions};

use super::helpers::{
    cluster_config, fake_backends, fast_options, fresh_hosts, join_material,
    provisioned_hosts, state_with, FakeClusterApi, FakeEtcd, ScriptedAdapter,
};

#[tokio::test]
async fn install_initializes_the_leader_then_joins_the_rest() {
    let adapter = join_material(&fresh_hosts(&ScriptedAdapter::new()));
    let state = state_with(
        cluster_config(3, 2),
        adapter.clone(),
        Backends::default(),
        fast_options(),
    );

    plans::install_tasks().run(&state).await.unwrap();

    assert_eq!(state.leader().unwrap().name(), "cp-0");
    assert_eq!(adapter.hosts_that_ran("apt-get install").len(), 5);

    let commands = adapter.commands();
    let init: Vec<&(String, String)> = commands
        .iter()
        .filter(|(_, c)| c.contains("kubeadm init \\"))
        .collect();
    assert_eq!(init.len(), 1);
    assert_eq!(init[0].0, "cp-0");
    assert!(init[0].1.contains("--control-plane-endpoint=192.168.0.10:6443"));
    assert!(init[0].1.contains("--kubernetes-version=v1.29.3"));

    let control_plane_joins: Vec<String> = commands
        .iter()
        .filter(|(_, c)| c.contains("--control-plane\n") || c.contains("--control-plane \\"))
        .map(|(h, _)| h.clone())
        .collect();
    assert_eq!(control_plane_joins, vec!["cp-1", "cp-2"]);

    let worker_joins = adapter.hosts_that_ran("--discovery-token-ca-cert-hash");
    assert!(worker_joins.contains("w-0"));
    assert!(worker_joins.contains("w-1"));
}

fn upgrade_options(target: &str, force: bool) -> RunOptions {
    RunOptions {
        target_version: Some(target.to_string()),
        force_upgrade: force,
        ..fast_options()
    }
}

#[tokio::test]
async fn upgrade_goes_leader_first_then_one_host_at_a_time() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0", "cp-1", "cp-2"], &[]);
    let api = FakeClusterApi::with_nodes(&["cp-0", "cp-1", "cp-2", "w-0"]);
    let state = state_with(
        cluster_config(3, 1),
        adapter.clone(),
        fake_backends(&["cp-0", "cp-1", "cp-2"], &etcd, &api),
        upgrade_options("1.30.0", false),
    );

    plans::upgrade_tasks().run(&state).await.unwrap();

    let upgrades: Vec<(String, bool)> = adapter
        .commands()
        .into_iter()
        .filter(|(_, c)| c.contains("kubeadm upgrade"))
        .map(|(h, c)| (h, c.contains("upgrade apply")))
        .collect();
    assert_eq!(
        upgrades,
        vec![
            ("cp-0".to_string(), true),
            ("cp-1".to_string(), false),
            ("cp-2".to_string(), false),
            ("w-0".to_string(), false),
        ]
    );

    // drains and uncordons go through the leader
    assert_eq!(
        adapter.hosts_that_ran(" drain "),
        ["cp-0".to_string()].into_iter().collect()
    );
    assert_eq!(adapter.hosts_that_ran("kubelet=1.30.0").len(), 4);

    let commands = adapter.commands();
    let position = |host: &str, needle: &str| {
        commands
            .iter()
            .position(|(h, c)| h == host && c.contains(needle))
            .unwrap_or_else(|| panic!("{host} never ran {needle:?}"))
    };
    for host in ["cp-0", "cp-1", "cp-2", "w-0"] {
        let drain = position("cp-0", &format!(" drain {host} "));
        let kubeadm_package = position(host, "kubeadm=1.30.0");
        let kubeadm = position(host, "kubeadm upgrade");
        let kubelet = position(host, "restart kubelet");
        let uncordon = position("cp-0", &format!("uncordon {host}"));
        assert!(drain < kubeadm_package, "{host}: drain before packages");
        assert!(kubeadm_package < kubeadm, "{host}: kubeadm package before kubeadm upgrade");
        assert!(kubeadm < kubelet, "{host}: kubeadm upgrade before kubelet restart");
        assert!(kubelet < uncordon, "{host}: kubelet restart before uncordon");
    }
}

#[tokio::test]
async fn kubelet_restarts_only_after_the_api_server_is_upgraded() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0"], &[]);
    let api = FakeClusterApi::with_nodes(&["cp-0"]);
    let state = state_with(
        cluster_config(1, 0),
        adapter.clone(),
        fake_backends(&["cp-0"], &etcd, &api),
        upgrade_options("1.30.0", false),
    );

    plans::upgrade_tasks().run(&state).await.unwrap();

    let commands = adapter.commands();
    let apply = commands
        .iter()
        .position(|(_, c)| c.contains("kubeadm upgrade apply"))
        .unwrap();
    let kubelet_restarts: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, (_, c))| c.contains("restart kubelet"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(kubelet_restarts.len(), 1);
    assert!(kubelet_restarts[0] > apply);
    assert!(commands[..apply]
        .iter()
        .all(|(_, c)| !c.contains("kubelet=1.30.0")));
}

#[tokio::test]
async fn upgrade_beyond_the_skew_policy_changes_nothing() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0"], &[]);
    let api = FakeClusterApi::with_nodes(&["cp-0"]);
    let state = state_with(
        cluster_config(1, 0),
        adapter.clone(),
        fake_backends(&["cp-0"], &etcd, &api),
        upgrade_options("1.31.0", false),
    );

    let err = plans::upgrade_tasks().run(&state).await.unwrap_err();

    assert_eq!(err.operation(), Some("validate version skew"));
    assert!(matches!(
        err,
        Error::Operation { ref source, .. } if matches!(**source, Error::Validation { .. })
    ));
    assert!(adapter.hosts_that_ran("kubeadm upgrade").is_empty());
}

#[tokio::test]
async fn forced_upgrade_proceeds_despite_skew() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0"], &[]);
    let api = FakeClusterApi::with_nodes(&["cp-0"]);
    let state = state_with(
        cluster_config(1, 0),
        adapter.clone(),
        fake_backends(&["cp-0"], &etcd, &api),
        upgrade_options("1.31.0", true),
    );

    plans::upgrade_tasks().run(&state).await.unwrap();
    assert_eq!(
        adapter.hosts_that_ran("kubeadm upgrade apply -y v1.31.0"),
        ["cp-0".to_string()].into_iter().collect()
    );
}

#[tokio::test]
async fn downgrade_is_refused_even_when_forced() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0"], &[]);
    let api = FakeClusterApi::with_nodes(&["cp-0"]);
    let state = state_with(
        cluster_config(1, 0),
        adapter.clone(),
        fake_backends(&["cp-0"], &etcd, &api),
        upgrade_options("1.28.0", true),
    );

    let err = plans::upgrade_tasks().run(&state).await.unwrap_err();
    assert_eq!(err.operation(), Some("validate version skew"));
    assert!(adapter.hosts_that_ran("kubeadm upgrade").is_empty());
}
