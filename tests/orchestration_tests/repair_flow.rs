//! etcd reconciliation and the `apply` plan against fake collaborators

use keel::reconcile::reconcile_etcd;
use keel::tasks::plans;
use keel::Error;

use super::helpers::{
    cluster_config, fake_backends, fast_options, join_material, provisioned_hosts, state_with,
    FakeClusterApi, FakeEtcd, Reply, ScriptedAdapter,
};

fn is_manual_intervention(err: &Error) -> bool {
    match err {
        Error::ManualIntervention { .. } => true,
        Error::Operation { source, .. } => is_manual_intervention(source),
        _ => false,
    }
}

#[tokio::test]
async fn apply_removes_an_unknown_member_and_its_node() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0", "cp-1", "cp-2", "old-3"], &[]);
    let api = FakeClusterApi::with_nodes(&["cp-0", "cp-1", "cp-2", "old-3", "w-0"]);
    let state = state_with(
        cluster_config(3, 1),
        adapter.clone(),
        fake_backends(&["cp-0", "cp-1", "cp-2"], &etcd, &api),
        fast_options(),
    );

    plans::apply_tasks().run(&state).await.unwrap();

    assert_eq!(*etcd.removed.lock(), vec![4]);
    assert_eq!(*api.deleted.lock(), vec!["old-3"]);
    // nothing else needed repairing
    assert!(adapter.hosts_that_ran("kubeadm").is_empty());
}

#[tokio::test]
async fn plan_previews_only_the_needed_repairs() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0", "cp-1", "cp-2"], &[]);
    let api = FakeClusterApi::with_nodes(&["cp-0", "cp-1", "cp-2"]);
    let state = state_with(
        cluster_config(3, 1),
        adapter,
        fake_backends(&["cp-0", "cp-1", "cp-2"], &etcd, &api),
        fast_options(),
    );

    plans::probe_tasks().run(&state).await.unwrap();
    let planned = plans::repair_tasks().descriptions(&state);

    // w-0 has no Node object yet
    assert!(planned.contains(&"join missing static workers".to_string()));
    assert!(!planned.contains(&"join missing control-plane hosts one by one".to_string()));
    assert!(!planned.contains(&"reset broken hosts and delete their nodes".to_string()));
    assert!(!planned.contains(&"run kubeadm init on the leader".to_string()));
}

#[tokio::test]
async fn apply_replaces_a_broken_follower() {
    let adapter = join_material(&provisioned_hosts(&ScriptedAdapter::new(), "1.29.3"));
    let etcd = FakeEtcd::with_members(&["cp-0", "cp-1", "cp-2"], &["cp-2"]);
    let api = FakeClusterApi::with_nodes(&["cp-0", "cp-1", "cp-2", "w-0"]);
    let state = state_with(
        cluster_config(3, 1),
        adapter.clone(),
        fake_backends(&["cp-0", "cp-1"], &etcd, &api),
        fast_options(),
    );

    plans::apply_tasks().run(&state).await.unwrap();

    let only_cp2 = ["cp-2".to_string()].into_iter().collect();
    assert_eq!(adapter.hosts_that_ran("kubeadm reset"), only_cp2);
    assert_eq!(*api.deleted.lock(), vec!["cp-2"]);
    assert_eq!(*etcd.removed.lock(), vec![3]);
    assert_eq!(adapter.hosts_that_ran("apt-get install"), only_cp2);
    assert_eq!(adapter.hosts_that_ran("--control-plane"), only_cp2);
    assert_eq!(
        adapter.hosts_that_ran("--print-join-command"),
        ["cp-0".to_string()].into_iter().collect()
    );

    // the reset came before the member removal made room for the rejoin
    let commands = adapter.commands();
    let reset = commands
        .iter()
        .position(|(_, c)| c.contains("kubeadm reset"))
        .unwrap();
    let join = commands
        .iter()
        .position(|(_, c)| c.contains("--control-plane"))
        .unwrap();
    assert!(reset < join);
}

#[tokio::test]
async fn broken_leader_stops_apply_before_any_change() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3").on_host(
        "cp-0",
        "systemctl show kubelet -p LoadState",
        Reply::ok("LoadState=loaded\nActiveState=activating\nSubState=auto-restart\n"),
    );
    let etcd = FakeEtcd::with_members(&["cp-0", "cp-1", "cp-2"], &[]);
    let api = FakeClusterApi::with_nodes(&["cp-0", "cp-1", "cp-2"]);
    let state = state_with(
        cluster_config(3, 0),
        adapter.clone(),
        fake_backends(&["cp-0", "cp-1", "cp-2"], &etcd, &api),
        fast_options(),
    );

    let err = plans::apply_tasks().run(&state).await.unwrap_err();

    assert_eq!(err.operation(), Some("check broken hosts"));
    assert!(is_manual_intervention(&err));
    assert!(adapter.hosts_that_ran("kubeadm").is_empty());
    assert!(api.deleted.lock().is_empty());
}

#[tokio::test]
async fn reconcile_refuses_without_quorum() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0", "cp-1", "cp-2"], &["cp-1", "cp-2"]);
    let api = FakeClusterApi::with_nodes(&["cp-0", "cp-1", "cp-2"]);
    let mut config = cluster_config(3, 0);
    config.set_leader(0);
    let state = state_with(
        config,
        adapter,
        fake_backends(&["cp-0"], &etcd, &api),
        fast_options(),
    );
    state.set_cluster_api(api.clone());

    let err = reconcile_etcd(state).await.unwrap_err();

    assert!(is_manual_intervention(&err));
    assert!(etcd.removed.lock().is_empty());
    assert!(api.deleted.lock().is_empty());
}

#[tokio::test]
async fn reconcile_drops_nodes_whose_member_is_gone() {
    let adapter = provisioned_hosts(&ScriptedAdapter::new(), "1.29.3");
    let etcd = FakeEtcd::with_members(&["cp-0", "cp-1", "cp-2"], &[]);
    // old-9 lost its member earlier but kept the Node object
    let api = FakeClusterApi::with_nodes(&["cp-0", "cp-1", "cp-2", "old-9", "w-0"]);
    let mut config = cluster_config(3, 1);
    config.set_leader(0);
    let state = state_with(
        config,
        adapter,
        fake_backends(&["cp-0"], &etcd, &api),
        fast_options(),
    );
    state.set_cluster_api(api.clone());

    reconcile_etcd(state).await.unwrap();

    assert!(etcd.removed.lock().is_empty());
    assert_eq!(*api.deleted.lock(), vec!["old-9"]);
}
