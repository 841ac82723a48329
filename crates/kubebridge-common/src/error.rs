//! Error types for the kubebridge service
//!
//! Errors are structured with fields to aid debugging in production. Startup
//! errors (schema, identity, configuration) are fatal and keep the bridge from
//! starting; everything raised during reconciliation is retried.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kubebridge operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The canonical schema source could not be read or parsed
    #[error("schema source error [{path}]: {message}")]
    SchemaSource {
        /// Path (or embedded name) of the schema source
        path: String,
        /// Description of what failed
        message: String,
    },

    /// The compiled representative type no longer decodes under the canonical schema
    #[error("schema mismatch for {schema}: {message}")]
    SchemaMismatch {
        /// Lineage name of the schema
        schema: String,
        /// Description of the divergence
        message: String,
    },

    /// The representative type is not structurally assignable to the canonical schema
    #[error("schema incompatible for {schema} at {field}: {message}")]
    SchemaIncompatible {
        /// Lineage name of the schema
        schema: String,
        /// Dotted path of the offending field (e.g. "spec.url")
        field: String,
        /// Description of the incompatibility
        message: String,
    },

    /// Two descriptors declared the same group/version/kind
    #[error("duplicate resource identity {identity}")]
    DuplicateIdentity {
        /// The identity declared twice
        identity: String,
    },

    /// A client was requested for an identity that was never built
    #[error("no client registered for {identity}")]
    NotRegistered {
        /// The identity that was requested
        identity: String,
    },

    /// A typed accessor was used with a type whose identity differs from the client's
    #[error("kind mismatch: client serves {expected}, requested {actual}")]
    KindMismatch {
        /// Identity served by the client
        expected: String,
        /// Identity of the requested type
        actual: String,
    },

    /// Store contract error
    #[error("store error: {source}")]
    Store {
        /// The underlying store error
        #[from]
        source: StoreError,
    },

    /// Control-plane resourceVersion cannot be translated into a store version
    #[error("invalid resourceVersion {value:?} on {name}")]
    InvalidResourceVersion {
        /// Name of the resource carrying the version
        name: String,
        /// The offending resourceVersion token
        value: String,
    },

    /// An object is missing data the bridge depends on
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource being validated
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Invalid bridge configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// A reconcile attempt was cancelled before it finished
    #[error("cancelled [{context}]")]
    Cancelled {
        /// Where the cancellation was observed (e.g. "attempt-timeout", "shutdown")
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "runtime", "clientset")
        context: String,
    },
}

/// Errors returned by a store backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record with the given identifier
    #[error("record {key} not found")]
    NotFound {
        /// UID or name used for the lookup
        key: String,
    },

    /// Optimistic-concurrency conflict on update
    #[error("stale version for {uid}: {message}")]
    StaleVersion {
        /// UID of the record
        uid: String,
        /// Description of the conflict
        message: String,
    },

    /// Insert of a record that already exists
    #[error("record {uid} already exists")]
    Conflict {
        /// UID of the record
        uid: String,
    },

    /// Backend unavailable or failed transiently
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Description of what failed
        message: String,
    },
}

impl StoreError {
    /// Create a not-found error
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a stale-version error
    pub fn stale(uid: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StaleVersion {
            uid: uid.into(),
            message: msg.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable {
            message: msg.into(),
        }
    }

    /// Whether this is the expected "no such record" signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl Error {
    /// Create a schema source error
    pub fn schema_source(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SchemaSource {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a schema mismatch error
    pub fn schema_mismatch(schema: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            schema: schema.into(),
            message: msg.into(),
        }
    }

    /// Create a schema incompatibility error for a field path
    pub fn schema_incompatible(
        schema: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::SchemaIncompatible {
            schema: schema.into(),
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
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
    /// Every control-plane, store, and cancellation error is retried with a
    /// fixed delay. Schema, identity, and configuration errors require a code
    /// or config fix and are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Store { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
            Error::SchemaSource { .. }
            | Error::SchemaMismatch { .. }
            | Error::SchemaIncompatible { .. }
            | Error::DuplicateIdentity { .. }
            | Error::NotRegistered { .. }
            | Error::KindMismatch { .. }
            | Error::InvalidResourceVersion { .. }
            | Error::Validation { .. }
            | Error::Config { .. } => false,
        }
    }

    /// Whether this error is a store-side stale-version conflict
    pub fn is_stale_version(&self) -> bool {
        matches!(
            self,
            Error::Store {
                source: StoreError::StaleVersion { .. }
            }
        )
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Cancelled { context } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: startup errors stop the bridge, runtime errors are retried
    #[test]
    fn story_startup_errors_are_fatal() {
        let err = Error::schema_mismatch("datasource", "field url has type integer");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("schema mismatch for datasource"));

        let err = Error::schema_incompatible("datasource", "spec.url", "field removed");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("spec.url"));

        let err = Error::DuplicateIdentity {
            identity: "core.kubebridge.io/v1alpha1/DataSource".to_string(),
        };
        assert!(!err.is_retryable());

        assert!(!Error::config("workers must be at least 1").is_retryable());
    }

    #[test]
    fn story_reconcile_errors_are_retried() {
        let err: Error = StoreError::unavailable("connection refused").into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection refused"));

        let err: Error = StoreError::stale("abc", "stored version 4 > 3").into();
        assert!(err.is_retryable());
        assert!(err.is_stale_version());

        assert!(Error::cancelled("attempt-timeout").is_retryable());
        assert!(Error::internal("unexpected").is_retryable());
    }

    #[test]
    fn invalid_resource_version_is_not_retried() {
        let err = Error::InvalidResourceVersion {
            name: "ds-1".to_string(),
            value: "abc".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("\"abc\""));
    }

    #[test]
    fn store_not_found_is_recognized() {
        assert!(StoreError::not_found("abc").is_not_found());
        assert!(!StoreError::unavailable("down").is_not_found());
    }

    #[test]
    fn context_accessor() {
        let err = Error::internal_with_context("runtime", "queue closed");
        assert_eq!(err.context(), Some("runtime"));
        assert!(err.to_string().contains("[runtime]"));

        assert_eq!(Error::internal("x").context(), Some(UNKNOWN_CONTEXT));
        assert_eq!(Error::cancelled("shutdown").context(), Some("shutdown"));
        assert_eq!(Error::config("x").context(), None);
    }
}
