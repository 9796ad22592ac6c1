//! Common types for keel: errors, retry policy, telemetry and shared constants

#![deny(missing_docs)]

pub mod error;
pub mod retry;
pub mod telemetry;

pub use error::{Error, HostFailure};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default SSH port on managed hosts
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Port the API server listens on (host-local, reached through a tunnel)
pub const DEFAULT_APISERVER_PORT: u16 = 6443;

/// Port etcd serves clients on (host-local, reached through a tunnel)
pub const DEFAULT_ETCD_CLIENT_PORT: u16 = 2379;

/// Label carried by every control-plane Node object
pub const CONTROL_PLANE_NODE_LABEL: &str = "node-role.kubernetes.io/control-plane";
