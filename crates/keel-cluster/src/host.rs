//! Live per-host state

use chrono::{DateTime, Utc};

use crate::config::{ContainerRuntimeConfig, HostConfig};
use crate::status::{ComponentState, ComponentStatus, ContainerStatus};

/// Everything observed about one configured host in a probing pass
///
/// A probe replaces the whole record; a record is never partially updated.
#[derive(Debug, Clone, Default)]
pub struct Host {
    /// The configuration this host was probed against
    pub config: HostConfig,
    /// Runtimes the cluster is configured with
    pub container_runtime: ContainerRuntimeConfig,
    /// Docker daemon status (only meaningful when docker is configured)
    pub docker: ComponentStatus,
    /// containerd status
    pub containerd: ComponentStatus,
    /// kubelet status
    pub kubelet: ComponentStatus,
    /// API server static pod (control plane only)
    pub api_server: ContainerStatus,
    /// etcd member (control plane only)
    pub etcd: ContainerStatus,
    /// A Node object with this hostname exists
    pub is_in_cluster: bool,
    /// Earliest `notAfter` of the control-plane certificates
    pub earliest_cert_expiry: Option<DateTime<Utc>>,
    /// Admin kubeconfig downloaded from this host
    pub kubeconfig: Option<Vec<u8>>,
}

impl Host {
    /// A fresh record for a host, nothing observed yet
    pub fn new(config: HostConfig, container_runtime: ContainerRuntimeConfig) -> Self {
        Self {
            config,
            container_runtime,
            ..Default::default()
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Configured runtimes are all healthy
    ///
    /// containerd is always checked; docker additionally when configured.
    pub fn container_runtime_healthy(&self) -> bool {
        let containerd = self.containerd.healthy();
        if self.container_runtime.docker {
            containerd && self.docker.healthy()
        } else {
            containerd
        }
    }

    /// Configured runtimes are all installed, active and running
    pub fn container_runtime_provisioned(&self) -> bool {
        let containerd = self.containerd.is_provisioned();
        if self.container_runtime.docker {
            containerd && self.docker.is_provisioned()
        } else {
            containerd
        }
    }

    /// Kubelet has completed first-time initialization
    pub fn kubelet_initialized(&self) -> bool {
        self.kubelet
            .state
            .contains(ComponentState::KUBELET_INITIALIZED)
    }

    /// Runtime and kubelet provisioned and kubelet initialized
    pub fn is_provisioned(&self) -> bool {
        self.container_runtime_provisioned()
            && self.kubelet.is_provisioned()
            && self.kubelet_initialized()
    }

    fn healthy(&self) -> bool {
        self.is_in_cluster && self.container_runtime_healthy() && self.kubelet.healthy()
    }

    /// Healthy member with a healthy API server
    pub fn control_plane_healthy(&self) -> bool {
        self.healthy() && self.api_server.healthy()
    }

    /// Healthy member
    pub fn worker_healthy(&self) -> bool {
        self.healthy()
    }
}
