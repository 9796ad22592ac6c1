//! Desired and observed cluster state for keel
//!
//! [`ClusterConfig`] is what the operator declared; [`LiveCluster`] is what
//! the last probing pass observed. Every health and safety decision the
//! orchestrator makes is a pure predicate over [`LiveCluster`].

#![deny(missing_docs)]

pub mod config;
pub mod host;
pub mod live;
pub mod status;
pub mod version;

pub use config::{
    BastionConfig, CloudProviderConfig, ClusterConfig, ContainerRuntimeConfig,
    EncryptionProvidersConfig, HostConfig, HostGroup, KubeletConfig, OperatingSystem, SshConfig,
    VersionConfig,
};
pub use host::Host;
pub use live::{
    quorum, CcmStatus, EncryptionConfiguration, LiveCluster, RepairVersion, SharedCluster,
};
pub use status::{ComponentState, ComponentStatus, ContainerStatus};
pub use version::{find_version, kube_version_string, parse_version};
