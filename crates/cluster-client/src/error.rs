//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the Kubernetes API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Transport or decoding error from kube
    #[error("Kubernetes error: {0}")]
    Kube(kube::Error),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict that survived all retries
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request throttled, for evictions this means a PodDisruptionBudget blocks it
    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    /// Any other status returned by the API server
    #[error("API error ({code}): {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Server supplied message
        message: String,
    },

    /// Object is missing a field the operation depends on
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match ae.code {
                404 => ClusterError::NotFound(ae.message.clone()),
                409 => ClusterError::Conflict(ae.message.clone()),
                429 => ClusterError::TooManyRequests(ae.message.clone()),
                code => ClusterError::Api {
                    code,
                    message: ae.message.clone(),
                },
            },
            other => ClusterError::Kube(other),
        }
    }
}

impl ClusterError {
    /// Whether the object was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    /// Whether an eviction that failed this way may succeed later.
    ///
    /// 429 means a disruption budget is holding the pod, 500 usually means
    /// overlapping budgets; both clear up on their own or through an operator.
    pub fn is_retriable_eviction(&self) -> bool {
        match self {
            ClusterError::TooManyRequests(_) => true,
            ClusterError::Api { code, .. } => *code >= 500,
            ClusterError::Kube(_) => true,
            _ => false,
        }
    }
}
