//! Error types shared across the operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error (network, conflict, server-side rejection)
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// An adapter returned data that violates the reconcile contract
    /// (missing employer, duplicate employee ids, wrong concrete type)
    #[error("Adapter contract violation: {0}")]
    AdapterContract(String),

    /// Invalid resource spec
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Operator misconfiguration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Finalizer handling failed
    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(err))
    }
}

impl Error {
    /// Whether a retry with backoff is likely to succeed.
    ///
    /// Conflicts, throttling and server-side hiccups are retriable;
    /// contract violations and invalid specs are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(ae)) => {
                matches!(ae.code, 409 | 429 | 500 | 503 | 504)
            }
            Error::KubeError(_) => true,
            Error::FinalizerError(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_contract_not_retriable() {
        let err = Error::AdapterContract("employer is nil".to_string());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_conflict_is_retriable() {
        let ae = kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        };
        let err = Error::KubeError(kube::Error::Api(ae));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_validation_not_retriable() {
        let err = Error::ValidationError("selector must not be empty".to_string());
        assert!(!err.is_retriable());
    }
}
