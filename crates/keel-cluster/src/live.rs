//! Live cluster aggregate and the health/safety predicates built on it
//!
//! All predicates here are pure: they read the last probing pass and never
//! touch a host. `control_plane` and `static_workers` are pre-allocated before
//! parallel probing and stay index-stable for the whole command.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use semver::Version;

use crate::config::{ClusterConfig, HostConfig};
use crate::host::Host;

/// Certificates expiring within this window are renewed automatically
pub const CERT_RENEWAL_WINDOW_DAYS: i64 = 90;

/// Live cluster shared between parallel probes
pub type SharedCluster = Arc<Mutex<LiveCluster>>;

/// Minimum members that must agree for etcd to make progress
pub fn quorum(members: usize) -> usize {
    members / 2 + 1
}

/// In-tree vs external cloud provider snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CcmStatus {
    /// kube-controller-manager still runs with an in-tree `--cloud-provider`
    pub in_tree_cloud_provider_enabled: bool,
    /// kube-controller-manager runs with `--cloud-provider=external`
    pub in_tree_cloud_provider_unregistered: bool,
    /// An external cloud-controller-manager workload is deployed
    pub external_ccm_deployed: bool,
    /// CSIMigration feature gates are set
    pub csi_migration_enabled: bool,
}

impl CcmStatus {
    /// The cluster can move from the in-tree provider to an external CCM
    pub fn migration_eligible(&self) -> bool {
        self.in_tree_cloud_provider_enabled && !self.external_ccm_deployed
    }

    /// Migration was started but has not finished unregistering the in-tree provider
    pub fn migration_in_progress(&self) -> bool {
        self.external_ccm_deployed && !self.in_tree_cloud_provider_unregistered
    }
}

/// Encryption-at-rest snapshot read from the leader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionConfiguration {
    /// The API server runs with an encryption provider config
    pub enabled: bool,
    /// Raw provider configuration, when readable
    pub config: Option<String>,
}

/// Outcome of [`LiveCluster::safe_to_repair`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairVersion {
    /// The requested target is not older than anything running
    pub safe: bool,
    /// Version the repair must use
    pub version: Version,
}

/// Observed state of the whole cluster
#[derive(Debug, Clone, Default)]
pub struct LiveCluster {
    /// Control-plane hosts, in manifest order
    pub control_plane: Vec<Host>,
    /// Static workers, in manifest order
    pub static_workers: Vec<Host>,
    /// Version the manifest asks for
    pub expected_version: Option<Version>,
    /// Encryption provider snapshot
    pub encryption: Option<EncryptionConfiguration>,
    /// Cloud provider snapshot, populated once per investigation
    pub ccm: Option<CcmStatus>,
}

impl LiveCluster {
    /// Pre-allocate one record per configured host
    pub fn from_config(config: &ClusterConfig) -> Self {
        let runtime = config.container_runtime;
        Self {
            control_plane: config
                .control_plane
                .hosts
                .iter()
                .map(|h| Host::new(h.clone(), runtime))
                .collect(),
            static_workers: config
                .static_workers
                .hosts
                .iter()
                .map(|h| Host::new(h.clone(), runtime))
                .collect(),
            expected_version: config.kubernetes_version().ok(),
            encryption: None,
            ccm: None,
        }
    }

    /// Wrap for sharing between parallel probes
    pub fn shared(self) -> SharedCluster {
        Arc::new(Mutex::new(self))
    }

    /// Every host, control plane first
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.control_plane.iter().chain(self.static_workers.iter())
    }

    /// Replace the record for `config.id` wholesale
    ///
    /// Returns false when the id is unknown (the slices are never resized).
    pub fn replace_host(&mut self, host: Host) -> bool {
        let id = host.config.id;
        let slot = self
            .control_plane
            .iter_mut()
            .chain(self.static_workers.iter_mut())
            .find(|h| h.config.id == id);
        match slot {
            Some(slot) => {
                *slot = host;
                true
            }
            None => false,
        }
    }

    /// Look up a control-plane host by id
    pub fn control_plane_host_mut(&mut self, id: usize) -> Option<&mut Host> {
        self.control_plane.iter_mut().find(|h| h.config.id == id)
    }

    /// Refresh the embedded host configs after discovery changed them
    pub fn sync_configs(&mut self, config: &ClusterConfig) {
        for host in self
            .control_plane
            .iter_mut()
            .chain(self.static_workers.iter_mut())
        {
            if let Some(updated) = config.hosts().find(|h| h.id == host.config.id) {
                host.config = updated.clone();
            }
        }
    }

    /// The control-plane host elected as leader
    pub fn leader(&self) -> Option<&Host> {
        self.control_plane.iter().find(|h| h.config.is_leader)
    }

    /// Every control-plane and worker host is individually healthy
    pub fn healthy(&self) -> bool {
        self.control_plane.iter().all(Host::control_plane_healthy)
            && self.static_workers.iter().all(Host::worker_healthy)
    }

    /// At least one control-plane host is installed and initialized
    ///
    /// Decides between "fresh install" and "acting on an existing cluster".
    pub fn is_provisioned(&self) -> bool {
        self.control_plane.iter().any(Host::is_provisioned)
    }

    /// Control-plane hosts with a healthy etcd member
    pub fn healthy_etcd_members(&self) -> usize {
        self.control_plane.iter().filter(|h| h.etcd.healthy()).count()
    }

    /// Additional etcd members that can be lost without losing quorum
    pub fn etcd_tolerance_remain(&self) -> usize {
        let healthy = self.healthy_etcd_members();
        healthy.saturating_sub(quorum(healthy))
    }

    /// Hosts that automated remediation may delete without breaking quorum
    ///
    /// 1. control-plane hosts with an unhealthy etcd member (already outside quorum);
    /// 2. up to the remaining tolerance of hosts whose only problem is the API server;
    /// 3. every static worker that is a member but not healthy.
    ///
    /// A host failing both etcd and API server checks is counted once, in step 1.
    pub fn safe_to_delete_hosts(&self) -> Vec<String> {
        let mut deletable = Vec::new();

        for host in &self.control_plane {
            if !host.etcd.healthy() {
                deletable.push(host.name().to_string());
            }
        }

        let mut tolerance = self.etcd_tolerance_remain();
        for host in &self.control_plane {
            if tolerance == 0 {
                break;
            }
            if host.etcd.healthy() && !host.api_server.healthy() {
                deletable.push(host.name().to_string());
                tolerance -= 1;
            }
        }

        for host in &self.static_workers {
            if host.is_in_cluster && !host.worker_healthy() {
                deletable.push(host.name().to_string());
            }
        }

        deletable
    }

    /// Members that are not healthy (diagnostic only)
    pub fn broken_hosts(&self) -> Vec<String> {
        let control_plane = self
            .control_plane
            .iter()
            .filter(|h| h.is_in_cluster && !h.control_plane_healthy());
        let workers = self
            .static_workers
            .iter()
            .filter(|h| h.is_in_cluster && !h.worker_healthy());
        control_plane
            .chain(workers)
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Any control-plane certificate expires within the renewal window of `now`
    pub fn certs_expire_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let deadline = now + window;
        self.control_plane
            .iter()
            .filter_map(|h| h.earliest_cert_expiry)
            .any(|expiry| expiry < deadline)
    }

    /// Any control-plane certificate expires in less than 90 days
    pub fn certs_to_expire_in_less_than_90_days(&self) -> bool {
        self.certs_expire_within(Utc::now(), Duration::days(CERT_RENEWAL_WINDOW_DAYS))
    }

    /// Highest kubelet version running on an in-cluster control-plane host
    pub fn highest_control_plane_version(&self) -> Option<Version> {
        self.control_plane
            .iter()
            .filter(|h| h.is_in_cluster)
            .filter_map(|h| h.kubelet.version.clone())
            .max()
    }

    /// Refuse to repair a cluster towards an older version than it runs
    ///
    /// The cluster version is monotonic: when `target` is lower than the
    /// highest version observed on an in-cluster control-plane host, that
    /// version becomes the floor.
    pub fn safe_to_repair(&self, target: &Version) -> RepairVersion {
        match self.highest_control_plane_version() {
            Some(highest) if highest > *target => RepairVersion {
                safe: false,
                version: highest,
            },
            _ => RepairVersion {
                safe: true,
                version: target.clone(),
            },
        }
    }

    /// Host configs of members whose probes show them broken
    pub fn broken_host_configs(&self) -> Vec<HostConfig> {
        let broken = self.broken_hosts();
        self.hosts()
            .filter(|h| broken.iter().any(|b| b == h.name()))
            .map(|h| h.config.clone())
            .collect()
    }
}
