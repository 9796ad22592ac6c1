//! etcd membership reconciliation
//!
//! Members that no configured host accounts for, or whose endpoint does not
//! answer, are removed from etcd first. Control-plane Node objects left
//! without an etcd member are deleted afterwards, so etcd (the source of
//! truth for quorum) is always repaired before the view derived from it.

use std::collections::HashSet;
use std::fmt;

use tracing::{info, warn};

use keel_cluster::{quorum, ClusterConfig};
use keel_common::{Error, Result};

use crate::cluster_api::ClusterApi;
use crate::etcd::{EtcdApi, EtcdMember};
use crate::state::State;

/// Why a member is scheduled for removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    /// Known host, but its endpoint failed the status query
    Unreachable(String),
    /// No configured host matches any of its identities
    Unknown,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Unreachable(error) => write!(f, "unreachable: {}", error),
            RemovalReason::Unknown => f.write_str("not a configured host"),
        }
    }
}

/// One member to remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRemoval {
    /// The member as listed
    pub member: EtcdMember,
    /// Why it goes
    pub reason: RemovalReason,
}

/// Everything one reconciliation pass will change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// etcd members to remove, in list order
    pub removals: Vec<MemberRemoval>,
    /// Control-plane Node objects to delete afterwards
    pub node_deletions: Vec<String>,
}

impl ReconcilePlan {
    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.node_deletions.is_empty()
    }
}

/// Hostname and both addresses of every configured host
pub fn known_identities(config: &ClusterConfig) -> HashSet<String> {
    config
        .hosts()
        .flat_map(|h| h.identities())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

async fn member_reachable(etcd: &dyn EtcdApi, member: &EtcdMember) -> std::result::Result<(), String> {
    if member.client_urls.is_empty() {
        return Err("member advertises no client URL".to_string());
    }
    for url in &member.client_urls {
        etcd.member_status(url)
            .await
            .map_err(|e| format!("{}: {}", url, e))?;
    }
    Ok(())
}

/// Work out which members and Node objects go
///
/// A failing status query only schedules that member; it never aborts the
/// pass. Refuses when the reachable members are not a quorum, since etcd
/// cannot change membership then anyway.
pub async fn plan_reconcile(
    etcd: &dyn EtcdApi,
    api: &dyn ClusterApi,
    known: &HashSet<String>,
) -> Result<ReconcilePlan> {
    let members = etcd.member_list().await?;
    let mut plan = ReconcilePlan::default();
    let mut reachable = 0;

    for member in &members {
        let status = member_reachable(etcd, member).await;
        if status.is_ok() {
            reachable += 1;
        }

        let identities = member.identities();
        let reason = if !identities.iter().any(|id| known.contains(id)) {
            Some(RemovalReason::Unknown)
        } else {
            status.err().map(RemovalReason::Unreachable)
        };
        if let Some(reason) = reason {
            plan.removals.push(MemberRemoval {
                member: member.clone(),
                reason,
            });
        }
    }

    if !members.is_empty() && reachable < quorum(members.len()) {
        return Err(Error::manual_intervention(format!(
            "only {} of {} etcd members answer, quorum is lost",
            reachable,
            members.len()
        )));
    }
    if plan.removals.len() == members.len() && !members.is_empty() {
        return Err(Error::manual_intervention(
            "reconciliation would remove every etcd member",
        ));
    }

    let removed: HashSet<String> = plan
        .removals
        .iter()
        .flat_map(|r| r.member.identities())
        .collect();
    let present: HashSet<String> = members
        .iter()
        .filter(|m| !plan.removals.iter().any(|r| r.member.id == m.id))
        .flat_map(EtcdMember::identities)
        .collect();

    plan.node_deletions = api
        .control_plane_node_names()
        .await?
        .into_iter()
        .filter(|node| removed.contains(node) || !present.contains(node))
        .collect();

    Ok(plan)
}

/// Apply `plan`: etcd removals first, then Node deletions
pub async fn execute_reconcile(
    plan: &ReconcilePlan,
    etcd: &dyn EtcdApi,
    api: &dyn ClusterApi,
) -> Result<()> {
    for removal in &plan.removals {
        warn!(
            member = %removal.member.name,
            member_id = removal.member.id,
            reason = %removal.reason,
            "removing etcd member"
        );
        etcd.member_remove(removal.member.id).await?;
    }
    for node in &plan.node_deletions {
        info!(node = %node, "deleting node without etcd member");
        api.delete_node(node).await?;
    }
    Ok(())
}

/// Reconcile etcd membership through the leader
pub async fn reconcile_etcd(state: State) -> Result<()> {
    let leader = state.leader()?;
    let worker = state.for_host(&leader).await?;
    let etcd = state.backends.etcd.connect(worker.runner()?.clone()).await?;
    let api = state.cluster_api()?;
    let known = known_identities(&state.config.read());

    let plan = plan_reconcile(etcd.as_ref(), api.as_ref(), &known).await?;
    if plan.is_empty() {
        info!("etcd membership matches the configured hosts");
        return Ok(());
    }
    execute_reconcile(&plan, etcd.as_ref(), api.as_ref()).await
}
