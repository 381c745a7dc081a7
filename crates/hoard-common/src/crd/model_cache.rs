//! ModelCache CRD types
//!
//! A ModelCache declares one model artifact to be pre-staged on every
//! eligible node of its node groups. It is cluster-scoped: the same cached
//! copy serves workloads in any namespace. The controller owns the status
//! document; the spec is written once by an operator/admin and its
//! `sourceModelUri` and `modelSize` are immutable after creation.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::ModelDownloadState;

/// ModelCache declares a model artifact to pre-download onto node groups.
///
/// Deletion is gated by `modelcache.hoard.dev/finalizer` until the model
/// has been removed from every matched node's CacheNode.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hoard.dev",
    version = "v1alpha1",
    kind = "ModelCache",
    plural = "modelcaches",
    shortname = "mc",
    status = "ModelCacheStatus",
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.sourceModelUri"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.copies.available"}"#,
    printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.copies.total"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModelCacheSpec {
    /// Source URI of the model artifact (immutable after creation)
    pub source_model_uri: String,

    /// Declared size of the model artifact (Kubernetes quantity, e.g. "140Gi")
    pub model_size: String,

    /// Ordered list of CacheNodeGroup names whose nodes should hold a copy.
    ///
    /// The first entry is the default group, used for consumption volumes.
    pub node_groups: Vec<String>,
}

impl ModelCacheSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if self.source_model_uri.is_empty() {
            return Err("sourceModelUri must not be empty".to_string());
        }
        if self.node_groups.is_empty() {
            return Err("nodeGroups must list at least one node group".to_string());
        }
        Ok(())
    }

    /// Name of the default node group (first entry)
    pub fn default_node_group(&self) -> &str {
        &self.node_groups[0]
    }
}

/// Status of a ModelCache, written only by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelCacheStatus {
    /// Per-node download status, keyed by node name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_status: BTreeMap<String, NodeDownloadStatus>,

    /// Aggregate copy counts over `node_status`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copies: Option<ModelCopies>,

    /// Workloads currently consuming this cache.
    ///
    /// Kept accurate so the external deletion-validation hook can reject
    /// deletion while consumers exist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumers: Vec<NamespacedName>,
}

/// Aggregate copy counts for a ModelCache
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelCopies {
    /// Number of nodes with any recorded status
    pub total: usize,
    /// Number of nodes that finished the download
    pub available: usize,
    /// Number of nodes whose download failed
    pub failed: usize,
}

/// Identity of a consuming workload
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedName {
    /// Workload namespace
    pub namespace: String,
    /// Workload name
    pub name: String,
}

/// Per-node status of a cached model, as surfaced on the ModelCache
///
/// Closed vocabulary; other components rely on these exact wire words.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NodeDownloadStatus {
    /// Node matches a node group but is not ready; no agent report yet
    NotReady,
    /// Download has not started on the node
    #[default]
    DownloadPending,
    /// The per-node agent is transferring bytes
    Downloading,
    /// Terminal success: the node holds a complete copy
    Downloaded,
    /// Terminal failure: the download errored on the node
    DownloadError,
}

impl NodeDownloadStatus {
    /// Total mapping from the agent-reported per-model state.
    ///
    /// A missing report means the agent has not picked the model up yet.
    pub fn from_agent_state(state: Option<ModelDownloadState>) -> Self {
        match state {
            Some(ModelDownloadState::DownloadPending) | None => Self::DownloadPending,
            Some(ModelDownloadState::Downloading) => Self::Downloading,
            Some(ModelDownloadState::Downloaded) => Self::Downloaded,
            Some(ModelDownloadState::DownloadError) => Self::DownloadError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_spec() -> ModelCacheSpec {
        ModelCacheSpec {
            source_model_uri: "hf://meta-llama/Llama-3.3-70B-Instruct".to_string(),
            model_size: "140Gi".to_string(),
            node_groups: vec!["gpu".to_string()],
        }
    }

    #[test]
    fn validate_accepts_well_formed_spec() {
        assert!(make_spec().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_uri() {
        let mut spec = make_spec();
        spec.source_model_uri.clear();
        assert!(spec.validate().unwrap_err().contains("sourceModelUri"));
    }

    #[test]
    fn validate_rejects_empty_node_groups() {
        let mut spec = make_spec();
        spec.node_groups.clear();
        assert!(spec.validate().unwrap_err().contains("nodeGroups"));
    }

    #[test]
    fn default_node_group_is_first_entry() {
        let mut spec = make_spec();
        spec.node_groups.push("cpu".to_string());
        assert_eq!(spec.default_node_group(), "gpu");
    }

    #[test]
    fn node_status_wire_words_are_exact() {
        // Other components parse these strings; they must never drift.
        for (status, wire) in [
            (NodeDownloadStatus::NotReady, "\"NotReady\""),
            (NodeDownloadStatus::DownloadPending, "\"DownloadPending\""),
            (NodeDownloadStatus::Downloading, "\"Downloading\""),
            (NodeDownloadStatus::Downloaded, "\"Downloaded\""),
            (NodeDownloadStatus::DownloadError, "\"DownloadError\""),
        ] {
            assert_eq!(serde_json::to_string(&status).unwrap(), wire);
        }
    }

    #[test]
    fn agent_state_mapping_is_total() {
        use ModelDownloadState as M;
        use NodeDownloadStatus as N;
        assert_eq!(N::from_agent_state(None), N::DownloadPending);
        assert_eq!(N::from_agent_state(Some(M::DownloadPending)), N::DownloadPending);
        assert_eq!(N::from_agent_state(Some(M::Downloading)), N::Downloading);
        assert_eq!(N::from_agent_state(Some(M::Downloaded)), N::Downloaded);
        assert_eq!(N::from_agent_state(Some(M::DownloadError)), N::DownloadError);
    }

    #[test]
    fn status_serializes_camel_case() {
        let mut status = ModelCacheStatus::default();
        status
            .node_status
            .insert("n1".to_string(), NodeDownloadStatus::Downloaded);
        status.copies = Some(ModelCopies {
            total: 1,
            available: 1,
            failed: 0,
        });
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["nodeStatus"]["n1"], "Downloaded");
        assert_eq!(json["copies"]["available"], 1);
    }
}
