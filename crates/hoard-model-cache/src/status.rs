//! Status aggregation
//!
//! Folds the per-node agent reports into the ModelCache's node status map
//! and aggregate copy counts. Pure over its inputs: given the same CacheNode
//! snapshots and the same previous map, the result is identical, so a
//! no-change reconcile persists a no-change status.

use std::collections::BTreeMap;

use hoard_common::crd::{ModelCopies, ModelDownloadState, NodeDownloadStatus};

/// Compute the per-node status map and copy counts for one cache.
///
/// `ready` holds each ready, matched node's agent report for this model
/// (`None` when the agent has not picked the model up yet). `not_ready`
/// lists matched nodes whose `Ready` condition is not `True`; a previously
/// recorded status for such a node is kept rather than downgraded to
/// `NotReady`, so a node that downloaded the model and then went offline
/// still counts as holding a copy.
pub fn aggregate_status(
    previous: &BTreeMap<String, NodeDownloadStatus>,
    ready: &BTreeMap<String, Option<ModelDownloadState>>,
    not_ready: &[String],
) -> (BTreeMap<String, NodeDownloadStatus>, ModelCopies) {
    let mut node_status = BTreeMap::new();

    for node in not_ready {
        let status = previous
            .get(node)
            .copied()
            .unwrap_or(NodeDownloadStatus::NotReady);
        node_status.insert(node.clone(), status);
    }

    for (node, state) in ready {
        node_status.insert(node.clone(), NodeDownloadStatus::from_agent_state(*state));
    }

    let copies = ModelCopies {
        total: node_status.len(),
        available: node_status
            .values()
            .filter(|s| **s == NodeDownloadStatus::Downloaded)
            .count(),
        failed: node_status
            .values()
            .filter(|s| **s == NodeDownloadStatus::DownloadError)
            .count(),
    };

    (node_status, copies)
}
