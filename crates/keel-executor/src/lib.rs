//! Command execution for keel
//!
//! Adapters open per-host connections ([`LocalAdapter`] for the local shell,
//! [`OpenSshAdapter`] for remote hosts). The [`Connector`] caches them for a
//! run, [`LocalForward`] exposes host-local services on a loopback port and
//! [`Runner`] is the per-host façade tasks use to run commands.

#![deny(missing_docs)]

pub mod connector;
pub mod executor;
pub mod forward;
pub mod local;
pub mod runner;
pub mod ssh;

pub use connector::Connector;
pub use executor::{Adapter, AsyncStream, Connection, ExecOutput, Executor, StreamIo, Tunneler};
pub use forward::LocalForward;
pub use local::{LocalAdapter, LocalConnection};
pub use runner::{render, Runner};
pub use ssh::{OpenSshAdapter, SshConnection};
