//! CacheNodeGroup CRD types
//!
//! A CacheNodeGroup names a set of nodes eligible to hold cached models and
//! carries the PV/PVC templates used for every volume created on that group.
//! Eligibility is declared as node affinity on the PV template
//! (`spec.persistentVolume.nodeAffinity.required`), the same rules the
//! volumes themselves will be pinned by. Administrators own these objects;
//! the controller only reads them.

use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PersistentVolumeSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CacheNodeGroup declares a named set of cache-eligible nodes.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hoard.dev",
    version = "v1alpha1",
    kind = "CacheNodeGroup",
    plural = "cachenodegroups",
    shortname = "cng",
    printcolumn = r#"{"name":"Limit","type":"string","jsonPath":".spec.storageLimit"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CacheNodeGroupSpec {
    /// Total cache storage available per node in this group (Kubernetes quantity)
    pub storage_limit: String,

    /// Template for PersistentVolumes created on this group.
    ///
    /// Its `nodeAffinity.required` terms also define which nodes belong to
    /// the group. Absent affinity means every node matches.
    pub persistent_volume: PersistentVolumeSpec,

    /// Template for PersistentVolumeClaims bound to this group's volumes
    pub persistent_volume_claim: PersistentVolumeClaimSpec,
}
