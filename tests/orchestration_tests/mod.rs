//! Integration tests for keel's orchestration engine
//!
//! # Test Organization
//!
//! - `task_engine`: predicates, retry budgets and abort semantics of a plan
//! - `fan_out`: parallel and sequential per-host execution, error aggregation
//!   and connection eviction, on scripted hosts and the local shell
//! - `probe_flow`: discovery, probing and cluster investigation
//! - `repair_flow`: etcd reconciliation and the `apply` plan
//! - `lifecycle_flow`: `install` and `upgrade` end to end

mod fan_out;
mod helpers;
mod lifecycle_flow;
mod probe_flow;
mod repair_flow;
