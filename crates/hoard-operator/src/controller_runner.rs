//! Controller runner - wires the ModelCache controller and its watches
//!
//! Builds the controller future plus the CacheNodeGroup reflector it needs
//! for the node watch mapper. Construction is pure; the caller drives the
//! returned futures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Api, Client};

use hoard_common::crd::{CacheNode, CacheNodeGroup, ModelCache};
use hoard_common::events::KubeEventPublisher;
use hoard_common::FIELD_MANAGER;
use hoard_model_cache::{
    cache_node_mapper, error_policy, node_mapper, reconcile, workload_mapper, CacheContext,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn wc() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the CacheNodeGroup reflector.
///
/// The node watch mapper needs every group's affinity rules without an API
/// round trip per node event, so the groups are mirrored into a local store.
pub fn build_group_reflector(
    client: Client,
) -> (Store<CacheNodeGroup>, Pin<Box<dyn Future<Output = ()> + Send>>) {
    let groups: Api<CacheNodeGroup> = Api::all(client);
    let (store, writer) = reflector::store();

    let fut = watcher(groups, wc())
        .reflect(writer)
        .applied_objects()
        .for_each(|res| async move {
            if let Err(e) = res {
                tracing::warn!(error = %e, "CacheNodeGroup watch error");
            }
        });

    (store, Box::pin(fut))
}

/// Build the ModelCache controller future.
///
/// Owns the PV/PVC pairs it creates, and re-enqueues caches on labeled
/// workload changes, node readiness transitions, and CacheNode updates.
pub fn build_model_cache_controller(
    client: Client,
    cache_namespace: String,
    group_store: Store<CacheNodeGroup>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let events = Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER));
    let ctx = Arc::new(CacheContext::new(client.clone(), cache_namespace, events));

    let caches: Api<ModelCache> = Api::all(client.clone());
    let controller = Controller::new(caches, wc());
    let cache_store = controller.store();

    tracing::info!("- ModelCache controller");

    Box::pin(
        controller
            .owns(Api::<PersistentVolume>::all(client.clone()), wc())
            .owns(Api::<PersistentVolumeClaim>::all(client.clone()), wc())
            .watches(Api::<Deployment>::all(client.clone()), wc(), workload_mapper)
            .watches(
                Api::<Node>::all(client.clone()),
                wc(),
                node_mapper(cache_store, group_store),
            )
            .watches(Api::<CacheNode>::all(client), wc(), cache_node_mapper)
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ModelCache")),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
