//! Version-skew validation for upgrades
//!
//! Read-only: classifies a proposed transition as allowed, allowed with
//! warnings (forced), or forbidden. Nothing here touches the cluster.

use semver::Version;
use tracing::warn;

use keel_cluster::{parse_version, LiveCluster};
use keel_common::{Error, Result};

/// Minor versions the API server may move in one upgrade
pub const APISERVER_MAX_SKEW: u64 = 1;

/// Minor versions kubelets may lag behind the control plane
pub const KUBELET_MAX_SKEW: u64 = 2;

/// Outcome of a permitted upgrade check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkewVerdict {
    /// Within policy
    Allowed,
    /// Outside policy, but forced; each entry is one violation
    Warned(Vec<String>),
}

/// Check moving a component from `current` to `requested`
///
/// Equal versions and downgrades are rejected, as is a minor jump larger
/// than `max_minor_diff` or a change of major version.
pub fn check_version_skew(requested: &Version, current: &Version, max_minor_diff: u64) -> Result<()> {
    if requested == current {
        return Err(Error::validation(format!(
            "requested version {} is the current version",
            requested
        )));
    }
    if requested < current {
        return Err(Error::validation(format!(
            "requested version {} is older than current version {}",
            requested, current
        )));
    }
    if requested.major != current.major {
        return Err(Error::validation(format!(
            "cannot change major version from {} to {}",
            current, requested
        )));
    }
    let diff = requested.minor - current.minor;
    if diff > max_minor_diff {
        return Err(Error::validation(format!(
            "upgrading from {} to {} skips {} minor versions, at most {} allowed",
            current, requested, diff, max_minor_diff
        )));
    }
    Ok(())
}

fn api_server_version(live: &LiveCluster) -> Result<Option<Version>> {
    let mut versions: Vec<Version> = live
        .control_plane
        .iter()
        .filter(|h| h.api_server.healthy())
        .filter_map(|h| h.api_server.version.clone())
        .collect();
    versions.sort();
    versions.dedup();

    match versions.len() {
        0 => Ok(None),
        1 => Ok(versions.pop()),
        _ => Err(Error::manual_intervention(format!(
            "API servers report different versions ({}), finish or roll back the previous upgrade first",
            versions
                .iter()
                .map(Version::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Validate upgrading `live` to `target`
///
/// Downgrades and mixed API server versions are never allowed. Re-applying
/// the current version and skew violations are allowed only with `force`,
/// and then reported as warnings.
pub fn validate_upgrade(target: &str, live: &LiveCluster, force: bool) -> Result<SkewVerdict> {
    let target = parse_version(target)?;
    let mut problems = Vec::new();

    if let Some(current) = live.highest_control_plane_version() {
        if target < current {
            return Err(Error::validation(format!(
                "requested version {} is older than running version {}",
                target, current
            )));
        }
        if target == current {
            problems.push(format!("cluster already runs {}", current));
        }
    }

    let api_server = api_server_version(live)?;
    if let Some(api) = &api_server {
        if target != *api {
            if let Err(e) = check_version_skew(&target, api, APISERVER_MAX_SKEW) {
                problems.push(format!("kube-apiserver: {}", e));
            }
        }
    }

    for host in live.hosts().filter(|h| h.is_in_cluster) {
        let Some(kubelet) = &host.kubelet.version else {
            continue;
        };
        if target != *kubelet {
            if let Err(e) = check_version_skew(&target, kubelet, KUBELET_MAX_SKEW) {
                problems.push(format!("kubelet on {}: {}", host.name(), e));
            }
        }
        if let Some(api) = &api_server {
            if kubelet.minor > api.minor {
                problems.push(format!(
                    "kubelet on {} runs {}, newer than kube-apiserver {}",
                    host.name(),
                    kubelet,
                    api
                ));
            }
        }
    }

    if problems.is_empty() {
        return Ok(SkewVerdict::Allowed);
    }
    if force {
        for problem in &problems {
            warn!(target_version = %target, problem = %problem, "skew violation ignored by --force");
        }
        return Ok(SkewVerdict::Warned(problems));
    }
    Err(Error::validation(problems.join("; ")))
}
