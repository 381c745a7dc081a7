//! Watch mappers funneling external changes into cache reconciles
//!
//! Three trigger sources beyond the ModelCache itself:
//! - labeled workloads appearing/changing (consumer set changed)
//! - nodes becoming ready (new download target)
//! - CacheNode updates (agent reported progress)
//!
//! Each mapper only names which caches to reconcile; the reconciler
//! re-reads current state, so duplicate or stale triggers are harmless.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

use hoard_common::crd::{CacheNode, CacheNodeGroup, ModelCache};
use hoard_common::kube_utils::is_node_ready;
use hoard_common::MODEL_CACHE_LABEL;

use crate::matcher::node_matches_group;

/// Map a workload change to the cache it consumes, per its label.
pub fn workload_mapper(workload: Deployment) -> Option<ObjectRef<ModelCache>> {
    workload
        .labels()
        .get(MODEL_CACHE_LABEL)
        .map(|cache| ObjectRef::new(cache))
}

/// Map a node change to every cache whose node groups match it.
///
/// Only ready nodes enqueue anything: a node going NotReady changes no
/// placement decision (its recorded status is kept), while a node coming
/// up must get its CacheNode created promptly.
pub fn node_mapper(
    caches: Store<ModelCache>,
    groups: Store<CacheNodeGroup>,
) -> impl Fn(Node) -> Vec<ObjectRef<ModelCache>> {
    move |node: Node| {
        if !is_node_ready(&node) {
            return vec![];
        }
        caches
            .state()
            .iter()
            .filter(|cache| {
                cache.spec.node_groups.iter().any(|group_name| {
                    groups
                        .get(&ObjectRef::new(group_name))
                        .is_some_and(|group| node_matches_group(&group.spec, &node))
                })
            })
            .map(|cache| ObjectRef::new(&cache.name_any()))
            .collect()
    }
}

/// Map a CacheNode change to every cache it references.
///
/// Union of spec entries and status keys: during a drain the spec entry is
/// already gone while the agent's status row lingers, and both edges matter.
pub fn cache_node_mapper(cache_node: CacheNode) -> Vec<ObjectRef<ModelCache>> {
    let mut names: Vec<String> = cache_node
        .spec
        .models
        .iter()
        .map(|m| m.model_name.clone())
        .collect();
    if let Some(status) = &cache_node.status {
        names.extend(status.model_status.keys().cloned());
    }
    names.sort();
    names.dedup();
    names.into_iter().map(|n| ObjectRef::new(&n)).collect()
}
