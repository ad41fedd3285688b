//! Error types for the Darkroom operator
//!
//! Errors carry the resource they concern so a failed reconcile or request can
//! be traced back without the surrounding log context.

use thiserror::Error;

use crate::validation::InvalidError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Darkroom operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Admission rejected the Darkroom spec
    #[error(transparent)]
    Invalid(#[from] InvalidError),

    /// The addressed object does not exist
    #[error("{kind} \"{name}\" not found in namespace {namespace}")]
    NotFound {
        /// Resource kind (plural, e.g. "darkrooms")
        kind: String,
        /// Namespace that was searched
        namespace: String,
        /// Name that was looked up
        name: String,
    },

    /// Server-side apply of a child resource failed
    #[error("failed to apply {kind} {name}: {source}")]
    Apply {
        /// Kind of the child being applied
        kind: String,
        /// Name of the child being applied
        name: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// Writing the status subresource failed
    #[error("failed to update status of {name}: {source}")]
    StatusUpdate {
        /// Name of the Darkroom whose status was written
        name: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// Desired children could not be derived from the resource
    #[error("synthesis error for {name}: {message}")]
    Synthesis {
        /// Name of the Darkroom being synthesized
        name: String,
        /// Description of what is missing
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A subsystem could not be brought up
    #[error("startup error [{component}]: {message}")]
    Startup {
        /// Component that failed (e.g., "cache", "server")
        component: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "leader-election")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for a namespaced object
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an apply error for a child resource
    pub fn apply(kind: impl Into<String>, name: impl Into<String>, source: kube::Error) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            source,
        }
    }

    /// Create a status update error
    pub fn status_update(name: impl Into<String>, source: kube::Error) -> Self {
        Self::StatusUpdate {
            name: name.into(),
            source,
        }
    }

    /// Create a synthesis error
    pub fn synthesis(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Synthesis {
            name: name.into(),
            message: msg.into(),
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

    /// Create a startup error for a component
    pub fn startup(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Startup {
            component: component.into(),
            message: msg.into(),
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
    /// Apply and status errors are always retried, including 409 conflicts on
    /// resourceVersion. Rejected specs and startup failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is an optimistic concurrency conflict, other 4xx need a fix
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Invalid(_) => false,
            Error::NotFound { .. } => false,
            Error::Apply { .. } => true,
            Error::StatusUpdate { .. } => true,
            Error::Synthesis { .. } => true,
            Error::Serialization { .. } => false,
            Error::Startup { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// HTTP status code embedded in an API server response, if any
    pub fn api_status_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            }
            | Error::Apply {
                source: kube::Error::Api(ae),
                ..
            }
            | Error::StatusUpdate {
                source: kube::Error::Api(ae),
                ..
            } => Some(ae.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    /// Story: a resourceVersion conflict during status update is retried
    ///
    /// Two writers racing on the status subresource is normal; the loser just
    /// runs the cycle again against the fresh object.
    #[test]
    fn story_conflicts_are_retried() {
        let err = Error::status_update("gallery", api_error(409, "Conflict"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("gallery"));

        let err = Error::from(api_error(409, "Conflict"));
        assert!(err.is_retryable());
    }

    /// Story: apply failures name the child that failed
    #[test]
    fn story_apply_errors_name_the_child() {
        let err = Error::apply("Deployment", "gallery", api_error(500, "InternalError"));
        assert!(err.to_string().contains("Deployment gallery"));
        assert!(err.is_retryable());
        assert_eq!(err.api_status_code(), Some(500));
    }

    /// Story: permanent API errors stop the retry loop
    #[test]
    fn story_client_errors_are_not_retried() {
        assert!(!Error::from(api_error(403, "Forbidden")).is_retryable());
        assert!(!Error::from(api_error(422, "Invalid")).is_retryable());
        assert!(Error::from(api_error(503, "ServiceUnavailable")).is_retryable());
    }

    #[test]
    fn startup_errors_are_fatal() {
        let err = Error::startup("server", "invalid port 70000");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "startup error [server]: invalid port 70000");
    }

    #[test]
    fn not_found_has_no_embedded_status() {
        let err = Error::not_found("darkrooms", "default", "gallery");
        assert_eq!(err.api_status_code(), None);
        assert!(!err.is_retryable());
    }
}
