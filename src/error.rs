//! Error types for lookups, the manager and the ephemeral control plane
//!
//! Errors carry enough context (kind, key, operation) to be logged as
//! structured fields. Two predicates, [`Error::is_not_found`] and
//! [`Error::is_no_kind_match`], are the classification surface callers use
//! to decide how a failed lookup should be reported.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that has no more specific classification
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The kind is served but the object does not exist
    #[error("{kind} {name:?} not found in namespace {namespace:?}")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
        /// Namespace of the lookup (None for cluster-scoped kinds)
        namespace: Option<String>,
    },

    /// The API server has no schema for the group/version/kind
    #[error("no matches for kind {kind:?} in version {}", group_version(.group, .version))]
    NoKindMatch {
        /// API group ("" for the core group)
        group: String,
        /// API version
        version: String,
        /// Resource kind
        kind: String,
    },

    /// The lookup key was rejected before the object was fetched
    #[error("invalid object key {key:?}: {message}")]
    InvalidObjectKey {
        /// The rendered key
        key: String,
        /// What is wrong with it
        message: String,
    },

    /// An operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// The deadline that was exceeded
        after: Duration,
    },

    /// Ephemeral control-plane setup or teardown error
    #[error("environment error [{context}]: {message}")]
    Environment {
        /// Description of what failed
        message: String,
        /// Phase where the error occurred (e.g., "etcd", "kube-apiserver", "crds")
        context: String,
    },

    /// Manager lifecycle error
    #[error("manager error [{context}]: {message}")]
    Manager {
        /// Description of what failed
        message: String,
        /// Component where the error occurred (e.g., "start", "runnable", "health")
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being processed (if known)
        kind: Option<String>,
    },

    /// I/O error
    #[error("io error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

fn group_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}

impl Error {
    /// Create a not-found error for an object lookup
    pub fn not_found(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
            namespace,
        }
    }

    /// Create a no-kind-match error
    pub fn no_kind_match(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self::NoKindMatch {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Create an invalid-key error
    pub fn invalid_object_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidObjectKey {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create an environment error with the given message
    pub fn environment(msg: impl Into<String>) -> Self {
        Self::Environment {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an environment error with context
    pub fn environment_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Environment {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a manager error with context
    pub fn manager_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manager {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Check if the object was looked up under a served kind but does not exist
    ///
    /// Raw kube API errors count too: a 404 with reason `NotFound` means the
    /// same thing whether or not it went through the generic client.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404 && ae.reason == "NotFound",
            _ => false,
        }
    }

    /// Check if the API server has no schema for the requested kind
    pub fn is_no_kind_match(&self) -> bool {
        matches!(self, Error::NoKindMatch { .. })
    }

    /// Get the resource kind if this error is associated with one
    pub fn kind(&self) -> Option<&str> {
        match self {
            Error::NotFound { kind, .. } => Some(kind),
            Error::NoKindMatch { kind, .. } => Some(kind),
            Error::Serialization { kind, .. } => kind.as_deref(),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Environment { context, .. } => Some(context),
            Error::Manager { context, .. } => Some(context),
            _ => None,
        }
    }
}
