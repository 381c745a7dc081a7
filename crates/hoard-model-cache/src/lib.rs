//! ModelCache controller for Hoard
//!
//! Coordinates cluster-wide pre-staging of model artifacts:
//! - resolves which nodes belong to a cache's node groups
//! - keeps each node's CacheNode worklist in sync with the declared caches
//! - aggregates per-node agent reports into the cache's status
//! - provisions the PV/PVC pairs that let workloads mount cached copies
//! - drains every node reference before a deleted cache is released
//!
//! Secondary watches on Deployments, Nodes, and CacheNodes map external
//! changes back onto the owning ModelCache.

#![deny(missing_docs)]

mod deletion;
mod matcher;
mod node_agent;
mod reconciler;
mod status;
mod volumes;
mod watches;

pub use reconciler::{error_policy, reconcile, CacheContext};
pub use watches::{cache_node_mapper, node_mapper, workload_mapper};
