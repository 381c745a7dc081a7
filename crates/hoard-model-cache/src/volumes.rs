//! Cache volume provisioning
//!
//! Creates the PV/PVC pairs that expose a cached model: one download pair
//! per node group (mounted by the per-node agent in the cache namespace)
//! and one consumption pair per consuming namespace. Names are deterministic
//! over {cache, group, namespace}, creation is get-then-create, and an
//! existing object's spec is never mutated. Ownership points at the
//! ModelCache so the runtime garbage-collects the pairs with it.

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info};

use hoard_common::crd::{CacheNodeGroupSpec, ModelCache};
use hoard_common::{Error, Result};

/// Name of the download PV for a cache on a node group
pub fn download_pv_name(cache: &str, group: &str) -> String {
    format!("{cache}-{group}-download")
}

/// Name of the download PVC (lives in the cache namespace)
pub fn download_pvc_name(cache: &str, group: &str) -> String {
    format!("{cache}-{group}")
}

/// Name of the consumption PV for a cache in one consuming namespace
pub fn consumption_pv_name(cache: &str, group: &str, namespace: &str) -> String {
    format!("{cache}-{group}-{namespace}")
}

/// Name of the consumption PVC (lives in the consuming namespace)
pub fn consumption_pvc_name(cache: &str, group: &str) -> String {
    format!("{cache}-{group}")
}

/// Ensure the download PV/PVC pair for one node group exists.
///
/// The PVC lands in the cache namespace where the per-node agent mounts it.
pub async fn ensure_download_volumes(
    client: &Client,
    cache: &ModelCache,
    group_name: &str,
    group: &CacheNodeGroupSpec,
    cache_namespace: &str,
) -> Result<()> {
    let cache_name = cache.name_any();
    let pv_name = download_pv_name(&cache_name, group_name);
    ensure_pv(client, cache, &pv_name, group).await?;
    ensure_pvc(
        client,
        cache,
        &download_pvc_name(&cache_name, group_name),
        cache_namespace,
        group,
        &pv_name,
    )
    .await
}

/// Ensure the consumption PV/PVC pair for one consuming namespace exists.
pub async fn ensure_consumption_volumes(
    client: &Client,
    cache: &ModelCache,
    group_name: &str,
    group: &CacheNodeGroupSpec,
    namespace: &str,
) -> Result<()> {
    let cache_name = cache.name_any();
    let pv_name = consumption_pv_name(&cache_name, group_name, namespace);
    ensure_pv(client, cache, &pv_name, group).await?;
    ensure_pvc(
        client,
        cache,
        &consumption_pvc_name(&cache_name, group_name),
        namespace,
        group,
        &pv_name,
    )
    .await
}

/// OwnerReference pointing at the cache, marking it the controller.
fn owner_reference(cache: &ModelCache) -> Result<OwnerReference> {
    cache.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context("volumes", "ModelCache has no UID, cannot own volumes")
    })
}

async fn ensure_pv(
    client: &Client,
    cache: &ModelCache,
    name: &str,
    group: &CacheNodeGroupSpec,
) -> Result<()> {
    let api: Api<PersistentVolume> = Api::all(client.clone());

    if api.get_opt(name).await?.is_some() {
        debug!(pv = %name, "PersistentVolume already exists");
        return Ok(());
    }

    let pv = PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            owner_references: Some(vec![owner_reference(cache)?]),
            ..Default::default()
        },
        spec: Some(group.persistent_volume.clone()),
        ..Default::default()
    };

    info!(pv = %name, cache = %cache.name_any(), "Creating PersistentVolume");
    match api.create(&PostParams::default(), &pv).await {
        Ok(_) => Ok(()),
        // Lost a create race with a concurrent reconcile of the same cache.
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn ensure_pvc(
    client: &Client,
    cache: &ModelCache,
    name: &str,
    namespace: &str,
    group: &CacheNodeGroupSpec,
    volume_name: &str,
) -> Result<()> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);

    if api.get_opt(name).await?.is_some() {
        debug!(pvc = %name, namespace = %namespace, "PersistentVolumeClaim already exists");
        return Ok(());
    }

    // Pre-bind the claim to our PV; otherwise the provisioner could hand
    // it any volume with a matching class.
    let mut spec = group.persistent_volume_claim.clone();
    spec.volume_name = Some(volume_name.to_string());

    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner_reference(cache)?]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    };

    info!(pvc = %name, namespace = %namespace, cache = %cache.name_any(), "Creating PersistentVolumeClaim");
    match api.create(&PostParams::default(), &pvc).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
