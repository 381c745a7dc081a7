//! Error types for the Hoard operator
//!
//! Errors carry the name of the cache they relate to where one is known,
//! so reconcile failures in logs and events can be traced back to a
//! specific ModelCache without extra context.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Hoard operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {cache}: {message}")]
    Validation {
        /// Name of the cache with invalid configuration
        cache: String,
        /// Description of what's invalid
        message: String,
    },

    /// Configuration error: a resource the cache depends on is missing
    ///
    /// Raised when a named CacheNodeGroup does not exist. The whole
    /// reconcile fails rather than proceeding with a partial node set,
    /// which would silently under-report the aggregate copy counts.
    #[error("configuration error for {cache}: {message}")]
    Configuration {
        /// Name of the cache with the dangling reference
        cache: String,
        /// Description of what's missing
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "volumes")
        context: String,
    },
}

impl Error {
    /// Create a validation error with cache context
    pub fn validation_for(cache: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cache: cache.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error with cache context
    pub fn configuration_for(cache: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            cache: cache.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation errors require a spec fix and are never retried.
    /// Configuration errors are retryable: the missing node group may be
    /// created at any time. Kubernetes 4xx errors other than 409 Conflict
    /// indicate a request the server will keep rejecting.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::Configuration { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the cache name if this error is associated with a specific cache
    pub fn cache(&self) -> Option<&str> {
        match self {
            Error::Validation { cache, .. } => Some(cache),
            Error::Configuration { cache, .. } => Some(cache),
            _ => None,
        }
    }
}
