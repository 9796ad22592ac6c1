//! Observed component status
//!
//! systemd reports load, active and sub state on independent axes, so the
//! observed state is a set of orthogonal flags rather than a linear state
//! machine. Transitions happen on the host, outside of keel's control.

use bitflags::bitflags;
use semver::Version;

bitflags! {
    /// Flags observed for a systemd unit or a static pod
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ComponentState: u64 {
        /// Sub state not recognised
        const UNKNOWN = 1 << 0;
        /// Sub state `dead`
        const DEAD = 1 << 1;
        /// Sub state `auto-restart`
        const RESTARTING = 1 << 2;
        /// Unit file is loaded
        const INSTALLED = 1 << 3;
        /// Active state `active`
        const ACTIVE = 1 << 4;
        /// Sub state `running`
        const RUNNING = 1 << 5;
        /// Kubelet has written its kubeconfig (joined at least once)
        const KUBELET_INITIALIZED = 1 << 6;
        /// Static pod answered its health endpoint
        const POD_RUNNING = 1 << 7;
    }
}

impl ComponentState {
    /// Map the three systemd axes into flags
    pub fn from_systemd(load_state: &str, active_state: &str, sub_state: &str) -> Self {
        let mut state = ComponentState::empty();

        if load_state == "loaded" {
            state |= ComponentState::INSTALLED;
        }

        if active_state == "active" {
            state |= ComponentState::ACTIVE;
        }

        state |= match sub_state {
            "running" => ComponentState::RUNNING,
            "auto-restart" => ComponentState::RESTARTING,
            "dead" => ComponentState::DEAD,
            _ => ComponentState::UNKNOWN,
        };

        state
    }
}

/// Version and state of a systemd managed component (runtime, kubelet)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentStatus {
    /// Installed version, when it could be determined
    pub version: Option<Version>,
    /// Observed flags
    pub state: ComponentState,
}

impl ComponentStatus {
    /// Installed, enabled and running
    pub fn is_provisioned(&self) -> bool {
        self.state.contains(
            ComponentState::RUNNING | ComponentState::INSTALLED | ComponentState::ACTIVE,
        )
    }

    /// Running and not flapping
    pub fn healthy(&self) -> bool {
        self.state.contains(ComponentState::RUNNING)
            && !self.state.contains(ComponentState::RESTARTING)
    }
}

/// Version and state of a static pod (API server, etcd)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    /// Version reported by the pod, when known
    pub version: Option<Version>,
    /// Observed flags
    pub state: ComponentState,
}

impl ContainerStatus {
    /// Answered its health endpoint
    pub fn healthy(&self) -> bool {
        self.state.contains(ComponentState::POD_RUNNING)
    }

    /// A running container reporting `version`
    pub fn running(version: Option<Version>) -> Self {
        Self {
            version,
            state: ComponentState::POD_RUNNING,
        }
    }
}
