use std::sync::Arc;

use thiserror::Error;

/// Failure of a fetch, shared by every caller of the same miss episode.
///
/// The type is `Clone` because one settled result is handed to all awaiters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("network request failed: {0}")]
    Network(String),
    #[error("data service rejected the request{}: {message}", status_suffix(.status))]
    Service {
        status: Option<u16>,
        message: String,
    },
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("cached value for `{key}` is not a `{expected}`")]
    TypeMismatch { key: String, expected: &'static str },
    #[error("fetch task aborted: {0}")]
    Aborted(Arc<str>),
    #[error("session was cleared while the fetch was in flight")]
    SessionCleared,
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn service(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Service {
            status,
            message: message.into(),
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Service { .. } => "service",
            Self::NotAuthenticated => "not_authenticated",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::Aborted(_) => "aborted",
            Self::SessionCleared => "session_cleared",
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_error_includes_status_when_present() {
        let with_status = FetchError::service(Some(503), "maintenance");
        let without_status = FetchError::service(None, "maintenance");

        assert_eq!(
            with_status.to_string(),
            "data service rejected the request (503): maintenance"
        );
        assert_eq!(
            without_status.to_string(),
            "data service rejected the request: maintenance"
        );
    }

    #[test]
    fn kinds_are_stable_labels() {
        assert_eq!(FetchError::network("timeout").kind(), "network");
        assert_eq!(FetchError::NotAuthenticated.kind(), "not_authenticated");
    }
}
