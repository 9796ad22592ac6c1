//! Keel - provision, upgrade, repair and tear down Kubernetes control planes
//!
//! Keel drives kubeadm over SSH (or a local shell) on a declared set of
//! hosts, probes what is actually running, and reconciles the two.
//!
//! # Architecture
//!
//! Every command is a fixed, ordered list of tasks:
//! - Each task has its own retry budget and an optional applicability predicate
//! - Per-host work fans out in parallel (failures aggregated) or sequentially
//!   (stop at the first failure) when order is a safety dependency
//! - Probes write into one shared live cluster model; safety decisions are pure
//!   functions over that model
//!
//! # Modules
//!
//! - [`tasks`] - Task engine, host fan-out and the command plans
//! - [`state`] - Orchestration state handed to every task
//! - [`probe`] - Node prober and cluster investigation
//! - [`health`] - API server health checks through a host tunnel
//! - [`etcd`] - etcd client over the v3 JSON gateway
//! - [`reconcile`] - etcd membership reconciliation
//! - [`upgrade`] - Version-skew validation
//! - [`cluster_api`] - Kubernetes API access through the leader
//! - [`scripts`] - Shell script templates

#![deny(missing_docs)]

pub mod cluster_api;
pub mod etcd;
pub mod health;
pub mod probe;
pub mod reconcile;
pub mod scripts;
pub mod state;
pub mod tasks;
pub mod upgrade;

pub use keel_common::{Error, Result};
pub use state::{Backends, RunOptions, State};
pub use tasks::{Task, Tasks};
