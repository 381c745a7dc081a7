//! Common types for Hoard: CRDs, errors, events, and kube utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding the operator and the per-node-group download PVCs
pub const HOARD_SYSTEM_NAMESPACE: &str = "hoard-system";

/// Label key on serving workloads naming the ModelCache they consume
pub const MODEL_CACHE_LABEL: &str = "hoard.dev/model-cache";

/// Finalizer gating ModelCache deletion until every CacheNode reference is retracted
pub const MODEL_CACHE_FINALIZER: &str = "modelcache.hoard.dev/finalizer";

/// Field manager used for server-side apply and merge patches
pub const FIELD_MANAGER: &str = "hoard-model-cache";
