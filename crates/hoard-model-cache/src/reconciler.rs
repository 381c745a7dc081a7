//! ModelCache reconciliation controller
//!
//! The top-level control loop. Each invocation re-reads cluster state and
//! converges one cache:
//! - deletion timestamp set → hand off to the drain path
//! - finalizer absent → add it before anything else and wait for the
//!   fresh read
//! - otherwise: validate, resolve node groups, upsert CacheNode entries on
//!   ready matched nodes, ensure download volumes, aggregate and persist
//!   status, then ensure consumption volumes for every consuming namespace.
//!
//! Per-node upserts are best-effort so one unreachable node cannot stall
//! the rest of the fleet; node-group resolution and the status write fail
//! the whole reconcile.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use hoard_common::crd::{
    CacheNodeGroup, CacheNodeGroupSpec, ModelCache, ModelCacheStatus, ModelDownloadState,
    ModelEntry, NamespacedName,
};
use hoard_common::events::{actions, reasons, EventPublisher};
use hoard_common::kube_utils::{add_finalizer, replace_cluster_resource_status};
use hoard_common::retry::retry_on_conflict;
use hoard_common::{Error, Result, MODEL_CACHE_FINALIZER, MODEL_CACHE_LABEL};

use crate::deletion;
use crate::matcher::partition_group_nodes;
use crate::node_agent;
use crate::status::aggregate_status;
use crate::volumes;

/// Safety-net re-sync interval when nothing is changing
const RESYNC_PERIOD: Duration = Duration::from_secs(300);

/// Context shared by all reconciles of the ModelCache controller
pub struct CacheContext {
    /// Kubernetes client
    pub client: Client,
    /// Namespace holding the operator and the download PVCs
    pub cache_namespace: String,
    /// Event sink for user-visible reconcile outcomes
    pub events: Arc<dyn EventPublisher>,
}

impl CacheContext {
    /// Create a new context
    pub fn new(client: Client, cache_namespace: String, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            client,
            cache_namespace,
            events,
        }
    }
}

/// Error policy for the ModelCache controller.
///
/// Retryable errors come back quickly; a validation error needs a spec fix,
/// so it only re-enters with the safety-net period.
pub fn error_policy(_obj: Arc<ModelCache>, error: &Error, _ctx: Arc<CacheContext>) -> Action {
    warn!(error = %error, cache = error.cache().unwrap_or("unknown"), "ModelCache reconcile error, will retry");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::requeue(RESYNC_PERIOD)
    }
}

/// Reconcile one ModelCache to the declared state.
pub async fn reconcile(cache: Arc<ModelCache>, ctx: Arc<CacheContext>) -> Result<Action> {
    let name = cache.name_any();
    let client = &ctx.client;

    info!(cache = %name, "Reconciling ModelCache");

    // Drain takes precedence over everything, validation included: a cache
    // with a broken spec must still be releasable.
    if cache.meta().deletion_timestamp.is_some() {
        let groups = resolve_node_groups(client, &cache, ctx.events.as_ref()).await?;
        let nodes = list_nodes(client).await?;
        return deletion::drain(client, &cache, &groups, &nodes, ctx.events.as_ref()).await;
    }

    // The finalizer comes first so no CacheNode entry can ever be written
    // for a cache that is deletable without a drain.
    if !cache
        .finalizers()
        .iter()
        .any(|f| f == MODEL_CACHE_FINALIZER)
    {
        // Persist the finalizer and stop: the write triggers a new reconcile
        // with a fresh read, instead of acting on this possibly-stale copy.
        retry_on_conflict("add_finalizer", || async {
            add_finalizer::<ModelCache>(client, &name, MODEL_CACHE_FINALIZER).await?;
            Ok(())
        })
        .await?;
        debug!(cache = %name, "Finalizer added");
        return Ok(Action::await_change());
    }

    if let Err(msg) = cache.spec.validate() {
        ctx.events
            .publish(
                &cache.object_ref(&()),
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(msg.clone()),
            )
            .await;
        return Err(Error::validation_for(&name, msg));
    }

    // All groups must resolve before any node work happens. A partial node
    // set would miscount the aggregate totals.
    let groups = resolve_node_groups(client, &cache, ctx.events.as_ref()).await?;
    let nodes = list_nodes(client).await?;

    let entry = ModelEntry {
        model_name: name.clone(),
        source_model_uri: cache.spec.source_model_uri.clone(),
    };

    // One CacheNode entry per distinct node, even when groups overlap.
    let mut ready_reports: BTreeMap<String, Option<ModelDownloadState>> = BTreeMap::new();
    let mut not_ready: BTreeSet<String> = BTreeSet::new();

    for (group_name, group) in &groups {
        let (ready, group_not_ready) = partition_group_nodes(group, &nodes);

        for node in ready {
            let Some(node_name) = node.metadata.name.as_deref() else {
                continue;
            };
            if ready_reports.contains_key(node_name) {
                continue;
            }
            match node_agent::upsert(client, node_name, &entry).await {
                Ok(cache_node) => {
                    let report = cache_node
                        .status
                        .as_ref()
                        .and_then(|s| s.model_status.get(&name))
                        .copied();
                    ready_reports.insert(node_name.to_string(), report);
                }
                // Best-effort across nodes: this node simply contributes
                // nothing this round and is retried on the next pass.
                Err(e) => {
                    warn!(cache = %name, node = %node_name, error = %e, "CacheNode upsert failed, skipping node")
                }
            }
        }

        for node in group_not_ready {
            if let Some(node_name) = node.metadata.name.as_deref() {
                not_ready.insert(node_name.to_string());
            }
        }

        volumes::ensure_download_volumes(client, &cache, group_name, group, &ctx.cache_namespace)
            .await?;
    }
    not_ready.retain(|n| !ready_reports.contains_key(n));

    let previous = cache
        .status
        .as_ref()
        .map(|s| s.node_status.clone())
        .unwrap_or_default();
    let not_ready: Vec<String> = not_ready.into_iter().collect();
    let (node_status, copies) = aggregate_status(&previous, &ready_reports, &not_ready);

    let workloads: Api<Deployment> = Api::all(client.clone());
    let selector = format!("{MODEL_CACHE_LABEL}={name}");
    let consumers = workloads
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;
    let (consumers, consumer_namespaces) = consumer_identities(&consumers);

    let previous_copies = cache.status.as_ref().and_then(|s| s.copies);
    let status = ModelCacheStatus {
        node_status,
        copies: Some(copies),
        consumers,
    };
    // Whole-document replace: the status was computed from this round's
    // snapshot, so nodes that left the cluster and drained consumer lists
    // must not linger in the stored document.
    retry_on_conflict("persist_status", || async {
        replace_cluster_resource_status::<ModelCache>(client, &name, status.clone()).await?;
        Ok(())
    })
    .await?;
    debug!(
        cache = %name,
        total = copies.total,
        available = copies.available,
        failed = copies.failed,
        "Status persisted"
    );

    if Some(copies) != previous_copies {
        if copies.total > 0 && copies.available == copies.total {
            ctx.events
                .publish(
                    &cache.object_ref(&()),
                    EventType::Normal,
                    reasons::CACHE_READY,
                    actions::RECONCILE,
                    Some(format!("model cached on all {} node(s)", copies.total)),
                )
                .await;
        } else if copies.failed > 0 {
            ctx.events
                .publish(
                    &cache.object_ref(&()),
                    EventType::Warning,
                    reasons::DOWNLOAD_FAILED,
                    actions::RECONCILE,
                    Some(format!("download failed on {} node(s)", copies.failed)),
                )
                .await;
        }
    }

    // Consumption volumes use the default (first) node group's templates.
    // Namespaces that stop consuming keep their volumes: pruning could pull
    // storage out from under a workload mid-restart.
    let default_group_name = cache.spec.default_node_group();
    if let Some((group_name, group)) = groups.iter().find(|(n, _)| n == default_group_name) {
        for namespace in &consumer_namespaces {
            volumes::ensure_consumption_volumes(client, &cache, group_name, group, namespace)
                .await?;
        }
    }

    Ok(Action::requeue(RESYNC_PERIOD))
}

async fn list_nodes(client: &Client) -> Result<Vec<Node>> {
    let nodes: Api<Node> = Api::all(client.clone());
    Ok(nodes.list(&ListParams::default()).await?.items)
}

/// Resolve every node group the cache names, in spec order.
///
/// A missing group fails the reconcile as a configuration error.
async fn resolve_node_groups(
    client: &Client,
    cache: &ModelCache,
    events: &dyn EventPublisher,
) -> Result<Vec<(String, CacheNodeGroupSpec)>> {
    let api: Api<CacheNodeGroup> = Api::all(client.clone());
    let mut groups = Vec::with_capacity(cache.spec.node_groups.len());

    for group_name in &cache.spec.node_groups {
        match api.get_opt(group_name).await? {
            Some(group) => groups.push((group_name.clone(), group.spec)),
            None => {
                let msg = format!("node group {group_name} not found");
                events
                    .publish(
                        &cache.object_ref(&()),
                        EventType::Warning,
                        reasons::NODE_GROUP_MISSING,
                        actions::RECONCILE,
                        Some(msg.clone()),
                    )
                    .await;
                return Err(Error::configuration_for(cache.name_any(), msg));
            }
        }
    }
    Ok(groups)
}

/// Distinct consumer identities and namespaces from labeled workloads.
fn consumer_identities(workloads: &[Deployment]) -> (Vec<NamespacedName>, BTreeSet<String>) {
    let mut consumers = BTreeSet::new();
    let mut namespaces = BTreeSet::new();
    for workload in workloads {
        let (Some(namespace), Some(name)) = (
            workload.metadata.namespace.as_deref(),
            workload.metadata.name.as_deref(),
        ) else {
            continue;
        };
        namespaces.insert(namespace.to_string());
        consumers.insert(NamespacedName {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
    (consumers.into_iter().collect(), namespaces)
}
