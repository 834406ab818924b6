use std::time::Duration;
use thiserror::Error;

/// sidelink control plane errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Conflicting update on {0}, refetching")]
    Conflict(String),

    #[error("Table id pool exhausted: {0}")]
    PoolExhausted(#[from] common::AllocError),

    #[error("Network {network} on pod {pod} is not ready yet")]
    AttachmentNotReady { pod: String, network: String },

    #[error("Routing daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("Reconcile of {0} exceeded its deadline")]
    DeadlineExceeded(String),

    #[error("Invalid annotation {key} on {object}: {reason}")]
    InvalidAnnotation {
        object: String,
        key: String,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(ae.message),
            other => Error::Kube(other),
        }
    }
}

impl Error {
    /// Fixed retry delay for errors that do not back off exponentially
    pub fn fixed_requeue(&self) -> Option<Duration> {
        match self {
            Error::Conflict(_) => Some(Duration::from_secs(1)),
            Error::AttachmentNotReady { .. } => Some(Duration::from_secs(5)),
            Error::DaemonUnavailable(_) => Some(Duration::from_secs(5)),
            Error::DeadlineExceeded(_) => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    /// The object the reconcile was about no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// Short label used in metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube_error",
            Error::Conflict(_) => "conflict",
            Error::PoolExhausted(_) => "pool_exhausted",
            Error::AttachmentNotReady { .. } => "attachment_not_ready",
            Error::DaemonUnavailable(_) => "daemon_unavailable",
            Error::DeadlineExceeded(_) => "deadline_exceeded",
            Error::InvalidAnnotation { .. } => "invalid_annotation",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    #[test]
    fn test_409_maps_to_conflict() {
        let err: Error = api_error(409).into();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(err.fixed_requeue(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_other_api_errors_back_off() {
        let err: Error = api_error(500).into();
        assert!(matches!(err, Error::Kube(_)));
        assert_eq!(err.fixed_requeue(), None);
    }

    #[test]
    fn test_not_found() {
        let err: Error = api_error(404).into();
        assert!(err.is_not_found());
        assert!(!Error::Conflict("pod red/a".to_string()).is_not_found());
    }

    #[test]
    fn test_pool_exhausted_from_alloc_error() {
        let err: Error = common::AllocError::PoolExhausted { min: 1, max: 1 }.into();
        assert_eq!(err.metric_label(), "pool_exhausted");
        assert_eq!(err.fixed_requeue(), None);
    }
}
