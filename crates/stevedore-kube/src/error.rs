//! Error types for stevedore-kube

use stevedore_core::CoreError;
use thiserror::Error;

/// Result type for stevedore-kube operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur while opening or running a tunnel
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TunnelError {
    /// No free local port could be found
    #[error("unable to find an available port: {0}")]
    Allocation(#[source] std::io::Error),

    /// Service or pod lookup failed or timed out
    #[error("unable to find pod attached to {resource} in namespace '{namespace}': {message}")]
    Resolution {
        namespace: String,
        resource: String,
        message: String,
    },

    /// Resource kind is neither a pod nor a service
    #[error("unknown resource type: {0}")]
    UnsupportedResourceKind(String),

    /// Connect alias not advertised by any service
    #[error("no service carries connect label '{name}'")]
    NotFound { name: String },

    /// Stream could not be opened or failed before becoming ready
    #[error("unable to start the tunnel to {resource}: {message}")]
    Establish { resource: String, message: String },

    /// Every attempt failed
    #[error("unable to establish tunnel after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<TunnelError>,
    },

    /// Spec lacks a resource name or remote port
    #[error("{0}")]
    InvalidSpec(String),

    /// The session was closed before it became active
    #[error("tunnel closed")]
    Closed,

    /// `connect` called on a tunnel that is already forwarding
    #[error("tunnel is already connected on {endpoint}")]
    AlreadyConnected { endpoint: String },

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

/// Whether an error should stop the operation that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Abort the current attempt
    Fatal,
    /// Log and continue with what is already known
    Advisory,
}

impl From<CoreError> for TunnelError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::UnsupportedResourceKind { kind } => TunnelError::UnsupportedResourceKind(kind),
            other => TunnelError::InvalidSpec(other.to_string()),
        }
    }
}

impl TunnelError {
    /// Classify the error for callers that may proceed past it
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TunnelError::NotFound { .. } => ErrorSeverity::Advisory,
            _ => ErrorSeverity::Fatal,
        }
    }

    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, TunnelError::Api(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TunnelError::Closed
                | TunnelError::AlreadyConnected { .. }
                | TunnelError::InvalidSpec(_)
                | TunnelError::UnsupportedResourceKind(_)
        )
    }

    pub(crate) fn establish(resource: impl Into<String>, message: impl ToString) -> Self {
        TunnelError::Establish {
            resource: resource.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_advisory() {
        let err = TunnelError::NotFound {
            name: "podinfo".to_string(),
        };
        assert_eq!(err.severity(), ErrorSeverity::Advisory);
        assert_eq!(
            TunnelError::Closed.severity(),
            ErrorSeverity::Fatal
        );
    }

    #[test]
    fn test_core_error_conversion() {
        let err: TunnelError = CoreError::MissingResourceName.into();
        assert!(matches!(&err, TunnelError::InvalidSpec(m) if m == "missing resource name"));
        assert!(!err.is_retryable());

        let err: TunnelError = CoreError::UnsupportedResourceKind {
            kind: "deployment".to_string(),
        }
        .into();
        assert!(matches!(err, TunnelError::UnsupportedResourceKind(k) if k == "deployment"));
    }

    #[test]
    fn test_socket_failures_surface_as_allocation() {
        use std::error::Error as _;

        let err = TunnelError::Allocation(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "address in use",
        ));
        assert!(err.to_string().contains("address in use"));
        assert!(err.source().is_some());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_exhausted_wraps_cause() {
        let err = TunnelError::RetryExhausted {
            attempts: 3,
            source: Box::new(TunnelError::establish("pod/registry", "connection refused")),
        };
        assert_eq!(
            err.to_string(),
            "unable to establish tunnel after 3 attempts: unable to start the tunnel to pod/registry: connection refused"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
