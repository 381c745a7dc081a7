//! CRD type definitions for the `hoard.dev/v1alpha1` API group

mod cache_node;
mod model_cache;
mod node_group;

pub use cache_node::{CacheNode, CacheNodeSpec, CacheNodeStatus, ModelDownloadState, ModelEntry};
pub use model_cache::{
    ModelCache, ModelCacheSpec, ModelCacheStatus, ModelCopies, NamespacedName, NodeDownloadStatus,
};
pub use node_group::{CacheNodeGroup, CacheNodeGroupSpec};
