//! CacheNode CRD types
//!
//! One CacheNode exists per cluster node, named after the node. Its spec is
//! the worklist for the per-node download agent (which models to hold, from
//! where); its status is written back by that agent. Many ModelCaches can
//! target the same node, so every controller mutation of the model list goes
//! through read-then-conditional-update, never a blind overwrite.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CacheNode is the per-node agent resource: what to fetch, and how it went.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hoard.dev",
    version = "v1alpha1",
    kind = "CacheNode",
    plural = "cachenodes",
    shortname = "cn",
    status = "CacheNodeStatus",
    printcolumn = r#"{"name":"Models","type":"string","jsonPath":".spec.models[*].modelName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CacheNodeSpec {
    /// Models this node should hold. A model appears at most once.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelEntry>,
}

/// One model a node should hold
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    /// Name of the owning ModelCache
    pub model_name: String,
    /// Source URI to download from
    pub source_model_uri: String,
}

/// Status written by the per-node download agent.
///
/// Treated as untrusted, eventually-consistent input by the controller.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheNodeStatus {
    /// Per-model download state, keyed by ModelCache name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_status: BTreeMap<String, ModelDownloadState>,
}

/// Download state of one model on one node, as reported by the agent
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ModelDownloadState {
    /// Queued, transfer not started
    #[default]
    DownloadPending,
    /// Transfer in progress
    Downloading,
    /// Transfer finished, artifact verified on disk
    Downloaded,
    /// Transfer failed
    DownloadError,
}
