//! Finalizer-gated teardown
//!
//! A deleted ModelCache stays pinned by its finalizer until the model has
//! been retracted from every matched node's CacheNode, ready or not. Any
//! failed retraction keeps the finalizer in place and fails the reconcile,
//! so cleanup is at-least-once and no node reference is silently dropped.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{info, warn};

use hoard_common::crd::{CacheNodeGroupSpec, ModelCache};
use hoard_common::events::{actions, reasons, EventPublisher};
use hoard_common::kube_utils::remove_finalizer;
use hoard_common::retry::retry_on_conflict;
use hoard_common::{Result, MODEL_CACHE_FINALIZER};

use crate::matcher::node_matches_group;
use crate::node_agent;

/// Per-node retraction and finalizer release, behind a trait so the drain
/// ordering is testable without a cluster.
#[async_trait]
trait NodeRetractor: Send + Sync {
    /// Remove the model entry from one node's CacheNode.
    async fn retract(&self, node_name: &str, model_name: &str) -> Result<()>;
    /// Release the deletion finalizer on the named ModelCache.
    async fn release_finalizer(&self, cache_name: &str) -> Result<()>;
}

struct AgentRetractor<'a> {
    client: &'a Client,
}

#[async_trait]
impl NodeRetractor for AgentRetractor<'_> {
    async fn retract(&self, node_name: &str, model_name: &str) -> Result<()> {
        node_agent::remove(self.client, node_name, model_name).await
    }

    async fn release_finalizer(&self, cache_name: &str) -> Result<()> {
        retry_on_conflict("remove_finalizer", || async {
            remove_finalizer::<ModelCache>(self.client, cache_name, MODEL_CACHE_FINALIZER)
                .await?;
            Ok(())
        })
        .await
    }
}

/// Drain a cache that has been marked for deletion.
///
/// Retracts the model from every node matched by any of the cache's node
/// groups, then releases the finalizer. Without the finalizer there is
/// nothing left to gate, so the runtime is free to erase the object.
pub async fn drain(
    client: &Client,
    cache: &ModelCache,
    groups: &[(String, CacheNodeGroupSpec)],
    nodes: &[Node],
    events: &dyn EventPublisher,
) -> Result<Action> {
    run_drain(cache, groups, nodes, &AgentRetractor { client }, events).await
}

async fn run_drain(
    cache: &ModelCache,
    groups: &[(String, CacheNodeGroupSpec)],
    nodes: &[Node],
    retractor: &dyn NodeRetractor,
    events: &dyn EventPublisher,
) -> Result<Action> {
    let name = cache.name_any();

    if !cache
        .finalizers()
        .iter()
        .any(|f| f == MODEL_CACHE_FINALIZER)
    {
        return Ok(Action::await_change());
    }

    let matched = matched_node_names(groups, nodes);
    // Logged rather than evented: a failing drain re-enters here on every
    // retry and would emit an identical event each pass.
    info!(cache = %name, nodes = matched.len(), "Draining cache from matched nodes");

    let mut first_failure = None;
    for node in &matched {
        if let Err(e) = retractor.retract(node, &name).await {
            warn!(cache = %name, node = %node, error = %e, "Failed to retract model from node");
            first_failure.get_or_insert(e);
        }
    }
    if let Some(e) = first_failure {
        // Finalizer stays; the reconcile is retried until every node is clean.
        return Err(e);
    }

    retractor.release_finalizer(&name).await?;
    info!(cache = %name, "All node references retracted, finalizer released");
    events
        .publish(
            &cache.object_ref(&()),
            EventType::Normal,
            reasons::DRAIN_COMPLETE,
            actions::DRAIN,
            None,
        )
        .await;

    Ok(Action::await_change())
}

/// Distinct names of nodes matched by any group, ready or not.
///
/// Overlapping groups must not produce duplicate retractions, and a node
/// that went NotReady after downloading still holds bytes to account for.
pub fn matched_node_names(
    groups: &[(String, CacheNodeGroupSpec)],
    nodes: &[Node],
) -> BTreeSet<String> {
    let mut matched = BTreeSet::new();
    for (_, group) in groups {
        for node in nodes {
            if let Some(name) = node.metadata.name.as_deref() {
                if node_matches_group(group, node) {
                    matched.insert(name.to_string());
                }
            }
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::{
        NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectReference,
        PersistentVolumeClaimSpec, PersistentVolumeSpec, VolumeNodeAffinity,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use hoard_common::crd::ModelCacheSpec;
    use hoard_common::Error;

    fn group_matching_zone(zone: &str) -> CacheNodeGroupSpec {
        CacheNodeGroupSpec {
            storage_limit: "1Ti".to_string(),
            persistent_volume: PersistentVolumeSpec {
                node_affinity: Some(VolumeNodeAffinity {
                    required: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: Some(vec![NodeSelectorRequirement {
                                key: "zone".to_string(),
                                operator: "In".to_string(),
                                values: Some(vec![zone.to_string()]),
                            }]),
                            match_fields: None,
                        }],
                    }),
                }),
                ..Default::default()
            },
            persistent_volume_claim: PersistentVolumeClaimSpec::default(),
        }
    }

    fn node(name: &str, zone: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some([("zone".to_string(), zone.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn cache(finalizer: bool) -> ModelCache {
        let mut cache = ModelCache::new(
            "llama",
            ModelCacheSpec {
                source_model_uri: "hf://meta-llama/Llama-3.3-70B-Instruct".to_string(),
                model_size: "140Gi".to_string(),
                node_groups: vec!["gpu".to_string()],
            },
        );
        if finalizer {
            cache.metadata.finalizers = Some(vec![MODEL_CACHE_FINALIZER.to_string()]);
        }
        cache
    }

    #[derive(Default)]
    struct FakeRetractor {
        fail_node: Option<&'static str>,
        retracted: Mutex<Vec<String>>,
        released: AtomicU32,
    }

    #[async_trait]
    impl NodeRetractor for FakeRetractor {
        async fn retract(&self, node_name: &str, _model_name: &str) -> Result<()> {
            self.retracted.lock().unwrap().push(node_name.to_string());
            if self.fail_node == Some(node_name) {
                return Err(Error::internal("agent unreachable"));
            }
            Ok(())
        }

        async fn release_finalizer(&self, _cache_name: &str) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        reasons: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    #[tokio::test]
    async fn failed_retraction_keeps_the_finalizer() {
        let groups = vec![("gpu".to_string(), group_matching_zone("east"))];
        let nodes = vec![node("n1", "east"), node("n2", "east")];
        let retractor = FakeRetractor {
            fail_node: Some("n1"),
            ..Default::default()
        };
        let events = RecordingPublisher::default();

        let result = run_drain(&cache(true), &groups, &nodes, &retractor, &events).await;

        assert!(result.is_err());
        assert_eq!(retractor.released.load(Ordering::SeqCst), 0);
        // Every node is still attempted so one bad agent cannot shadow the rest.
        assert_eq!(
            *retractor.retracted.lock().unwrap(),
            vec!["n1".to_string(), "n2".to_string()]
        );
        assert!(events.reasons.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalizer_released_only_after_all_retractions() {
        let groups = vec![("gpu".to_string(), group_matching_zone("east"))];
        let nodes = vec![node("n1", "east"), node("n2", "east")];
        let retractor = FakeRetractor::default();
        let events = RecordingPublisher::default();

        let result = run_drain(&cache(true), &groups, &nodes, &retractor, &events).await;

        assert!(result.is_ok());
        assert_eq!(retractor.retracted.lock().unwrap().len(), 2);
        assert_eq!(retractor.released.load(Ordering::SeqCst), 1);
        // One completion event per drain; progress is logged, not evented.
        assert_eq!(
            *events.reasons.lock().unwrap(),
            vec![reasons::DRAIN_COMPLETE.to_string()]
        );
    }

    #[tokio::test]
    async fn drain_without_finalizer_touches_nothing() {
        let groups = vec![("gpu".to_string(), group_matching_zone("east"))];
        let nodes = vec![node("n1", "east")];
        let retractor = FakeRetractor::default();
        let events = RecordingPublisher::default();

        let result = run_drain(&cache(false), &groups, &nodes, &retractor, &events).await;

        assert!(result.is_ok());
        assert!(retractor.retracted.lock().unwrap().is_empty());
        assert_eq!(retractor.released.load(Ordering::SeqCst), 0);
        assert!(events.reasons.lock().unwrap().is_empty());
    }

    #[test]
    fn overlapping_groups_yield_distinct_nodes() {
        let groups = vec![
            ("a".to_string(), group_matching_zone("east")),
            ("b".to_string(), group_matching_zone("east")),
        ];
        let nodes = vec![node("n1", "east"), node("n2", "east"), node("n3", "west")];
        let matched = matched_node_names(&groups, &nodes);
        assert_eq!(
            matched.into_iter().collect::<Vec<_>>(),
            vec!["n1".to_string(), "n2".to_string()]
        );
    }

    #[test]
    fn not_ready_nodes_are_still_drained() {
        // matched_node_names ignores readiness on purpose: a NotReady node
        // may still hold a downloaded copy.
        let groups = vec![("a".to_string(), group_matching_zone("east"))];
        let nodes = vec![node("n1", "east")];
        assert_eq!(matched_node_names(&groups, &nodes).len(), 1);
    }
}
