//! Shared Kubernetes utilities using kube-rs

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, PostParams};
use kube::core::object::HasStatus;
use kube::Client;

/// The "Ready" condition type for nodes
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Check whether a node's `Ready` condition is `True`
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Add a finalizer to a cluster-scoped resource (no-op when already present).
///
/// Read-then-conditional-update: the replace carries the read's
/// resourceVersion, so a concurrent writer of the finalizer list turns
/// this into a 409 for the caller to retry with a fresh read.
pub async fn add_finalizer<T>(
    client: &Client,
    name: &str,
    finalizer: &str,
) -> std::result::Result<bool, kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + serde::Serialize
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::all(client.clone());
    let mut obj = api.get(name).await?;

    let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    finalizers.push(finalizer.to_string());

    api.replace(name, &PostParams::default(), &obj).await?;
    Ok(true)
}

/// Remove a finalizer from a cluster-scoped resource (no-op when absent).
pub async fn remove_finalizer<T>(
    client: &Client,
    name: &str,
    finalizer: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + serde::Serialize
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::all(client.clone());
    let mut obj = api.get(name).await?;

    let had_finalizer = obj
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer));
    if !had_finalizer {
        return Ok(());
    }
    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }

    api.replace(name, &PostParams::default(), &obj).await?;
    Ok(())
}

/// Replace the status sub-resource of a cluster-scoped resource.
///
/// Read-then-conditional-update: the controller computed `status` from a
/// fresh cluster snapshot, so the write must replace the stored document
/// wholesale. A merge patch would keep map keys the new snapshot dropped
/// (a node leaving the cluster, a consumer list emptying out). The replace
/// carries the read's resourceVersion, so a concurrent status writer turns
/// this into a 409 for the caller to retry with a fresh read.
pub async fn replace_cluster_resource_status<T>(
    client: &Client,
    name: &str,
    status: T::Status,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>
        + HasStatus
        + Clone
        + serde::Serialize
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::all(client.clone());
    let mut obj = api.get(name).await?;
    *obj.status_mut() = Some(status);
    let body = serde_json::to_vec(&obj).map_err(kube::Error::SerdeError)?;
    api.replace_status(name, &PostParams::default(), body).await?;
    Ok(())
}
