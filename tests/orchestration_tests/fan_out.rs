//! Per-host fan-out on scripted hosts and the local shell

use std::sync::Arc;

use keel::tasks::nodes::{
    run_task_on_all_nodes, run_task_on_followers, run_task_on_leader, run_task_on_nodes, Mode,
};
use keel::{Backends, Error, State};
use keel_cluster::HostConfig;
use keel_executor::LocalAdapter;

use super::helpers::{cluster_config, fast_options, state_with, Reply, ScriptedAdapter};

async fn touch(state: State, host: HostConfig) -> keel::Result<()> {
    state
        .runner()?
        .run_raw(&format!("touch /tmp/marker-{}", host.name()))
        .await?;
    Ok(())
}

#[tokio::test]
async fn parallel_reports_exactly_the_failing_hosts() {
    let adapter = ScriptedAdapter::new()
        .on_host("cp-1", "touch", Reply::fail(1))
        .on_host("w-1", "touch", Reply::fail(2));
    let state = state_with(
        cluster_config(3, 2),
        adapter.clone(),
        Backends::default(),
        fast_options(),
    );

    let err = run_task_on_all_nodes(&state, touch, Mode::Parallel)
        .await
        .unwrap_err();

    let mut failed = err.failed_hosts();
    failed.sort();
    assert_eq!(failed, vec!["cp-1", "w-1"]);

    // siblings of a failing host still finish
    let ran = adapter.hosts_that_ran("touch");
    assert_eq!(ran.len(), 5);
}

#[tokio::test]
async fn parallel_aggregate_is_retryable_when_a_host_is() {
    let adapter = ScriptedAdapter::new().on_host("cp-0", "touch", Reply::fail(1));
    let state = state_with(
        cluster_config(2, 0),
        adapter,
        Backends::default(),
        fast_options(),
    );

    let err = run_task_on_all_nodes(&state, touch, Mode::Parallel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HostFailures(ref f) if f.len() == 1));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn sequential_stops_at_the_first_failure() {
    let adapter = ScriptedAdapter::new().on_host("cp-1", "touch", Reply::fail(1));
    let state = state_with(
        cluster_config(3, 0),
        adapter.clone(),
        Backends::default(),
        fast_options(),
    );

    let hosts = state.config.read().control_plane.hosts.clone();
    let err = run_task_on_nodes(&state, hosts, touch, Mode::Sequential)
        .await
        .unwrap_err();

    assert_eq!(err.failed_hosts(), vec!["cp-1"]);
    let ran: Vec<String> = adapter.commands().into_iter().map(|(h, _)| h).collect();
    assert_eq!(ran, vec!["cp-0", "cp-1"]);
}

#[tokio::test]
async fn leader_and_followers_split_the_control_plane() {
    let adapter = ScriptedAdapter::new();
    let mut config = cluster_config(3, 1);
    config.set_leader(1);
    let state = state_with(config, adapter.clone(), Backends::default(), fast_options());

    run_task_on_leader(&state, touch).await.unwrap();
    assert_eq!(
        adapter.hosts_that_ran("touch"),
        ["cp-1".to_string()].into_iter().collect()
    );

    run_task_on_followers(&state, touch, Mode::Sequential)
        .await
        .unwrap();
    let order: Vec<String> = adapter.commands().into_iter().map(|(h, _)| h).collect();
    assert_eq!(order, vec!["cp-1", "cp-0", "cp-2"]);
}

#[tokio::test]
async fn no_leader_needs_manual_intervention() {
    let state = state_with(
        cluster_config(2, 0),
        ScriptedAdapter::new(),
        Backends::default(),
        fast_options(),
    );
    let err = run_task_on_leader(&state, touch).await.unwrap_err();
    assert!(matches!(err, Error::ManualIntervention { .. }));
}

#[tokio::test]
async fn transport_failure_evicts_the_cached_connection() {
    let adapter = ScriptedAdapter::new().on_host("cp-0", "touch", Reply::Transport);
    let state = state_with(
        cluster_config(2, 0),
        adapter.clone(),
        Backends::default(),
        fast_options(),
    );

    let err = run_task_on_all_nodes(&state, touch, Mode::Parallel)
        .await
        .unwrap_err();
    assert_eq!(err.failed_hosts(), vec!["cp-0"]);
    assert_eq!(adapter.opens(), 2);
    assert_eq!(state.connector.len(), 1);

    // the healthy host keeps its connection, the broken one dials again
    let _ = run_task_on_all_nodes(&state, touch, Mode::Parallel).await;
    assert_eq!(adapter.opens(), 3);
}

#[tokio::test]
async fn command_failure_keeps_the_connection() {
    let adapter = ScriptedAdapter::new().on_host("cp-0", "touch", Reply::fail(1));
    let state = state_with(
        cluster_config(1, 0),
        adapter.clone(),
        Backends::default(),
        fast_options(),
    );

    let _ = run_task_on_all_nodes(&state, touch, Mode::Parallel).await;
    let _ = run_task_on_all_nodes(&state, touch, Mode::Parallel).await;
    assert_eq!(adapter.opens(), 1);
}

#[tokio::test]
async fn local_shell_runs_every_host() {
    let dir = tempfile::tempdir().unwrap();
    let root = Arc::new(dir.path().to_path_buf());
    let state = state_with(
        cluster_config(2, 2),
        Arc::new(LocalAdapter::new()),
        Backends::default(),
        fast_options(),
    );

    run_task_on_all_nodes(
        &state,
        move |s, h| {
            let root = root.clone();
            async move {
                let command = format!("echo {} > {}/{}", h.name(), root.display(), h.name());
                s.runner()?.run_raw(&command).await?;
                Ok::<(), Error>(())
            }
        },
        Mode::Parallel,
    )
    .await
    .unwrap();

    for name in ["cp-0", "cp-1", "w-0", "w-1"] {
        let written = std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(written.trim(), name);
    }
}
