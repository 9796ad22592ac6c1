//! Desired cluster configuration as authored in the `KeelCluster` manifest
//!
//! Only discovery (hostname, operating system, leader) mutates these values
//! at runtime; everything else is read-only for the duration of a command.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};

use keel_common::{Error, Result, DEFAULT_SSH_PORT};

use crate::version::parse_version;

/// Operating systems keel knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystem {
    /// Ubuntu (apt)
    Ubuntu,
    /// Debian (apt)
    Debian,
    /// CentOS (yum)
    CentOS,
    /// Red Hat Enterprise Linux (yum)
    #[serde(rename = "rhel")]
    Rhel,
    /// Rocky Linux (yum)
    RockyLinux,
    /// Amazon Linux 2 (yum)
    #[serde(rename = "amzn")]
    AmazonLinux,
    /// Flatcar Container Linux (image based, binaries under /opt/bin)
    Flatcar,
    /// Not discovered yet
    #[default]
    Unknown,
}

impl OperatingSystem {
    /// Map the `ID` field of `/etc/os-release`
    pub fn from_os_release_id(id: &str) -> Self {
        match id.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "ubuntu" => Self::Ubuntu,
            "debian" => Self::Debian,
            "centos" => Self::CentOS,
            "rhel" => Self::Rhel,
            "rocky" => Self::RockyLinux,
            "amzn" => Self::AmazonLinux,
            "flatcar" => Self::Flatcar,
            _ => Self::Unknown,
        }
    }

    /// Image based systems ship binaries outside the package manager paths
    pub fn is_image_based(&self) -> bool {
        matches!(self, Self::Flatcar)
    }
}

/// SSH access parameters, consumed only by the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshConfig {
    /// Remote user
    pub username: String,
    /// Remote port
    pub port: u16,
    /// Private key passed with `-i`
    pub private_key_file: Option<PathBuf>,
    /// Agent socket exported as `SSH_AUTH_SOCK`
    pub agent_socket: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            port: DEFAULT_SSH_PORT,
            private_key_file: None,
            agent_socket: None,
        }
    }
}

/// Jump host used to reach a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BastionConfig {
    /// Bastion address
    pub address: String,
    /// Bastion port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Bastion user (defaults to the node's SSH user)
    #[serde(default)]
    pub username: Option<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Per-node kubelet tuning
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeletConfig {
    /// `--system-reserved`
    pub system_reserved: BTreeMap<String, String>,
    /// `--kube-reserved`
    pub kube_reserved: BTreeMap<String, String>,
    /// `--eviction-hard`
    pub eviction_hard: BTreeMap<String, String>,
    /// `--max-pods`
    pub max_pods: Option<u32>,
}

/// One configured node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Stable index assigned at load time (control plane first)
    #[serde(skip)]
    pub id: usize,
    /// Address the executor connects to
    #[serde(default)]
    pub public_address: String,
    /// Address used for in-cluster traffic
    #[serde(default)]
    pub private_address: String,
    /// Hostname; discovered when left empty
    #[serde(default)]
    pub hostname: String,
    /// SSH parameters
    #[serde(default)]
    pub ssh: SshConfig,
    /// Optional jump host
    #[serde(default)]
    pub bastion: Option<BastionConfig>,
    /// Reference node for single-node operations
    #[serde(default)]
    pub is_leader: bool,
    /// Discovered when left empty
    #[serde(default)]
    pub operating_system: OperatingSystem,
    /// Kubelet tuning
    #[serde(default)]
    pub kubelet: KubeletConfig,
}

impl HostConfig {
    /// Name used in logs and error aggregates
    pub fn name(&self) -> &str {
        if !self.hostname.is_empty() {
            &self.hostname
        } else if !self.public_address.is_empty() {
            &self.public_address
        } else {
            &self.private_address
        }
    }

    /// Address the executor dials
    pub fn ssh_address(&self) -> &str {
        if !self.public_address.is_empty() {
            &self.public_address
        } else {
            &self.private_address
        }
    }

    /// Every non-empty identity (hostname, public and private address)
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        [
            self.hostname.as_str(),
            self.public_address.as_str(),
            self.private_address.as_str(),
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
    }

    fn identity_key(&self) -> (String, String, String) {
        (
            self.public_address.clone(),
            self.private_address.clone(),
            self.hostname.clone(),
        )
    }
}

/// Which container runtimes the nodes run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerRuntimeConfig {
    /// Docker on top of containerd
    pub docker: bool,
    /// containerd (always checked)
    pub containerd: bool,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            docker: false,
            containerd: true,
        }
    }
}

/// Cloud provider integration settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudProviderConfig {
    /// Provider name (e.g. "openstack", "aws", "none")
    pub name: String,
    /// Run an external cloud-controller-manager
    pub external: bool,
    /// Enable CSI migration feature gates
    pub csi_migration: bool,
}

/// Encryption-at-rest settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncryptionProvidersConfig {
    /// Whether secrets are encrypted at rest
    pub enable: bool,
}

/// Target versions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionConfig {
    /// Kubernetes version (with or without leading `v`)
    pub kubernetes: String,
}

/// A group of hosts
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostGroup {
    /// Hosts in manifest order
    pub hosts: Vec<HostConfig>,
}

/// The whole desired cluster
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Target versions
    pub versions: VersionConfig,
    /// Control-plane hosts (also etcd members)
    pub control_plane: HostGroup,
    /// Static worker hosts
    #[serde(default)]
    pub static_workers: HostGroup,
    /// Container runtime selection
    #[serde(default)]
    pub container_runtime: ContainerRuntimeConfig,
    /// Cloud provider settings
    #[serde(default)]
    pub cloud_provider: CloudProviderConfig,
    /// Encryption-at-rest settings
    #[serde(default)]
    pub encryption_providers: Option<EncryptionProvidersConfig>,
}

impl ClusterConfig {
    /// Parse and validate a manifest
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: ClusterConfig = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("invalid manifest: {}", e)))?;
        config.assign_ids();
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    fn assign_ids(&mut self) {
        let hosts = self
            .control_plane
            .hosts
            .iter_mut()
            .chain(self.static_workers.hosts.iter_mut());
        for (id, host) in hosts.enumerate() {
            host.id = id;
        }
    }

    /// Structural validation of the manifest
    pub fn validate(&self) -> Result<()> {
        if self.control_plane.hosts.is_empty() {
            return Err(Error::validation_for_field(
                "controlPlane.hosts",
                "at least one control-plane host is required",
            ));
        }

        self.kubernetes_version()?;

        let mut seen = HashSet::new();
        for host in self.hosts() {
            if host.public_address.is_empty() && host.private_address.is_empty() {
                return Err(Error::validation_for_field(
                    "hosts",
                    format!("host #{} has neither a public nor a private address", host.id),
                ));
            }
            if !seen.insert(host.identity_key()) {
                return Err(Error::validation_for_field(
                    "hosts",
                    format!("host {} is configured more than once", host.name()),
                ));
            }
        }

        let leaders = self.control_plane.hosts.iter().filter(|h| h.is_leader).count();
        if leaders > 1 {
            return Err(Error::validation_for_field(
                "controlPlane.hosts",
                format!("{} hosts are marked isLeader, at most one is allowed", leaders),
            ));
        }
        if self.static_workers.hosts.iter().any(|h| h.is_leader) {
            return Err(Error::validation_for_field(
                "staticWorkers.hosts",
                "only control-plane hosts can be the leader",
            ));
        }

        Ok(())
    }

    /// Target Kubernetes version
    pub fn kubernetes_version(&self) -> Result<Version> {
        parse_version(&self.versions.kubernetes).map_err(|_| {
            Error::validation_for_field(
                "versions.kubernetes",
                format!("invalid Kubernetes version {:?}", self.versions.kubernetes),
            )
        })
    }

    /// All hosts, control plane first
    pub fn hosts(&self) -> impl Iterator<Item = &HostConfig> {
        self.control_plane
            .hosts
            .iter()
            .chain(self.static_workers.hosts.iter())
    }

    /// Mutable access to a host by id
    pub fn host_mut(&mut self, id: usize) -> Option<&mut HostConfig> {
        self.control_plane
            .hosts
            .iter_mut()
            .chain(self.static_workers.hosts.iter_mut())
            .find(|h| h.id == id)
    }

    /// The control-plane host marked as leader
    pub fn leader(&self) -> Option<&HostConfig> {
        self.control_plane.hosts.iter().find(|h| h.is_leader)
    }

    /// Control-plane hosts other than the leader
    pub fn followers(&self) -> Vec<HostConfig> {
        self.control_plane
            .hosts
            .iter()
            .filter(|h| !h.is_leader)
            .cloned()
            .collect()
    }

    /// Mark exactly one control-plane host (by id) as leader
    pub fn set_leader(&mut self, id: usize) {
        for host in self.control_plane.hosts.iter_mut() {
            host.is_leader = host.id == id;
        }
    }

    /// Whether secrets encryption is requested
    pub fn encryption_enabled(&self) -> bool {
        self.encryption_providers
            .as_ref()
            .map(|e| e.enable)
            .unwrap_or(false)
    }
}
