//! Kubernetes version parsing
//!
//! Kubernetes components report versions as `v1.29.3`, `Kubernetes v1.29.3`
//! or `v1.29.3+k3s1`; everything is normalised to a `semver::Version`.

use semver::Version;

use keel_common::{Error, Result};

/// Parse a Kubernetes style version string (leading `v` optional)
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(trimmed)
        .map_err(|e| Error::validation(format!("invalid version {:?}: {}", raw, e)))
}

/// Find the first `vX.Y.Z`-looking token in command output and parse it
///
/// Handles `Kubernetes v1.29.3`, `containerd github.com/containerd/containerd v1.7.13 7c3aca7`
/// and a bare `24.0.7` from `docker version --format`.
pub fn find_version(output: &str) -> Option<Version> {
    output
        .split_whitespace()
        .filter_map(|token| {
            let token = token.trim_matches(|c: char| c == ',' || c == '"');
            let candidate = token.strip_prefix('v').unwrap_or(token);
            if candidate.starts_with(|c: char| c.is_ascii_digit()) {
                Version::parse(candidate).ok()
            } else {
                None
            }
        })
        .next()
}

/// Render a version the way Kubernetes tooling expects it
pub fn kube_version_string(version: &Version) -> String {
    format!("v{}", version)
}
