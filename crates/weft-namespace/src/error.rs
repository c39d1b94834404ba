// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for namespace operations.
//!
//! Maps one-to-one onto the wire error taxonomy.

use std::fmt;

use weft_persistence::StoreError;

/// Result type using NamespaceError.
pub type Result<T> = std::result::Result<T, NamespaceError>;

/// Errors raised by the registry and the admin handler.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum NamespaceError {
    /// A request field failed validation.
    InvalidArgument {
        /// Human-readable reason.
        message: String,
    },

    /// The namespace does not exist.
    NotFound {
        /// Name or id of the missing namespace.
        namespace: String,
    },

    /// A namespace with the name or id already exists.
    AlreadyExists {
        /// The clashing handle.
        namespace: String,
    },

    /// Global namespace registration attempted outside the master cluster.
    NotMasterCluster {
        /// The cluster that received the request.
        current_cluster: String,
    },

    /// The namespace is not active in this cluster.
    NotActive {
        /// Namespace name.
        namespace: String,
        /// Cluster that is active.
        active_cluster: String,
    },

    /// A concurrent metadata write won; retry with fresh state.
    ConditionFailed {
        /// Details.
        message: String,
    },

    /// The store is unavailable or throttled.
    Unavailable {
        /// Details.
        message: String,
    },

    /// Unclassified failure.
    Internal {
        /// Details.
        message: String,
    },
}

impl NamespaceError {
    /// Convenience constructor for validation failures.
    pub fn invalid(message: impl Into<String>) -> Self {
        NamespaceError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Wire error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::NotFound { .. } => "NAMESPACE_NOT_FOUND",
            Self::AlreadyExists { .. } => "NAMESPACE_ALREADY_EXISTS",
            Self::NotMasterCluster { .. } => "FAILED_PRECONDITION",
            Self::NotActive { .. } => "NAMESPACE_NOT_ACTIVE",
            Self::ConditionFailed { .. } => "FAILED_PRECONDITION",
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::Internal { .. } => "INTERNAL",
        }
    }
}

impl fmt::Display for NamespaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { message } => write!(f, "invalid argument: {message}"),
            Self::NotFound { namespace } => write!(f, "namespace '{namespace}' not found"),
            Self::AlreadyExists { namespace } => {
                write!(f, "namespace '{namespace}' already exists")
            }
            Self::NotMasterCluster { current_cluster } => write!(
                f,
                "global namespaces can only be registered on the master cluster, not '{current_cluster}'"
            ),
            Self::NotActive {
                namespace,
                active_cluster,
            } => write!(
                f,
                "namespace '{namespace}' is active in cluster '{active_cluster}'"
            ),
            Self::ConditionFailed { message } => write!(f, "condition failed: {message}"),
            Self::Unavailable { message } => write!(f, "unavailable: {message}"),
            Self::Internal { message } => write!(f, "internal: {message}"),
        }
    }
}

impl std::error::Error for NamespaceError {}

impl From<StoreError> for NamespaceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) => NamespaceError::NotFound { namespace: message },
            StoreError::AlreadyExists(message) => {
                NamespaceError::AlreadyExists { namespace: message }
            }
            StoreError::ConditionFailed(message) => NamespaceError::ConditionFailed { message },
            err if err.is_retryable() => NamespaceError::Unavailable {
                message: err.to_string(),
            },
            err => NamespaceError::Internal {
                message: err.to_string(),
            },
        }
    }
}
