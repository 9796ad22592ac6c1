//! Fan-out of per-host work
//!
//! Parallel mode runs every host to completion and reports all failures
//! together. Sequential mode walks hosts in order and stops at the first
//! failure, for work where order is a safety dependency.

use std::future::Future;

use futures::future::join_all;
use tracing::{debug, warn};

use keel_cluster::HostConfig;
use keel_common::{Error, HostFailure, Result};

use crate::state::State;

/// How hosts are walked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every host concurrently, failures aggregated
    Parallel,
    /// One host at a time, stop at the first failure
    Sequential,
}

async fn run_on_host<F, Fut>(state: &State, host: HostConfig, f: &F) -> Result<()>
where
    F: Fn(State, HostConfig) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let result = match state.for_host(&host).await {
        Ok(worker) => f(worker, host.clone()).await,
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        if e.is_transport() {
            state.drop_connection(&host).await;
        }
    }
    result
}

/// Run `f` on every host in `hosts`
pub async fn run_task_on_nodes<F, Fut>(
    state: &State,
    hosts: Vec<HostConfig>,
    f: F,
    mode: Mode,
) -> Result<()>
where
    F: Fn(State, HostConfig) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match mode {
        Mode::Parallel => {
            let runs = hosts.into_iter().map(|host| {
                let name = host.name().to_string();
                let f = &f;
                async move { (name, run_on_host(state, host, f).await) }
            });

            let failures: Vec<HostFailure> = join_all(runs)
                .await
                .into_iter()
                .filter_map(|(host, result)| match result {
                    Ok(()) => None,
                    Err(error) => {
                        warn!(host = %host, error = %error, "host failed");
                        Some(HostFailure { host, error })
                    }
                })
                .collect();

            if failures.is_empty() {
                Ok(())
            } else {
                Err(Error::HostFailures(failures))
            }
        }
        Mode::Sequential => {
            for host in hosts {
                let name = host.name().to_string();
                debug!(host = %name, "running sequentially");
                if let Err(error) = run_on_host(state, host, &f).await {
                    warn!(host = %name, error = %error, "host failed, stopping");
                    return Err(Error::HostFailures(vec![HostFailure { host: name, error }]));
                }
            }
            Ok(())
        }
    }
}

/// Run `f` on the leader
pub async fn run_task_on_leader<F, Fut>(state: &State, f: F) -> Result<()>
where
    F: Fn(State, HostConfig) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let leader = state.leader()?;
    run_task_on_nodes(state, vec![leader], f, Mode::Sequential).await
}

/// Run `f` on every control-plane host except the leader
pub async fn run_task_on_followers<F, Fut>(state: &State, f: F, mode: Mode) -> Result<()>
where
    F: Fn(State, HostConfig) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let followers = state.config.read().followers();
    run_task_on_nodes(state, followers, f, mode).await
}

/// Run `f` on every control-plane host
pub async fn run_task_on_control_plane<F, Fut>(state: &State, f: F, mode: Mode) -> Result<()>
where
    F: Fn(State, HostConfig) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let hosts = state.config.read().control_plane.hosts.clone();
    run_task_on_nodes(state, hosts, f, mode).await
}

/// Run `f` on every static worker
pub async fn run_task_on_static_workers<F, Fut>(state: &State, f: F, mode: Mode) -> Result<()>
where
    F: Fn(State, HostConfig) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let hosts = state.config.read().static_workers.hosts.clone();
    run_task_on_nodes(state, hosts, f, mode).await
}

/// Run `f` on every configured host
pub async fn run_task_on_all_nodes<F, Fut>(state: &State, f: F, mode: Mode) -> Result<()>
where
    F: Fn(State, HostConfig) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let hosts: Vec<HostConfig> = state.config.read().hosts().cloned().collect();
    run_task_on_nodes(state, hosts, f, mode).await
}
