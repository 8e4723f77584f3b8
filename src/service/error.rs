//! Error types for the research job service client.
//!
//! [`ServiceError`] covers rate limiting, rejected handles, API errors and
//! network failures. Callers use [`ServiceError::is_retryable`] and
//! [`ServiceError::is_session_invalid`] to decide between retrying, opening a
//! fresh session, or giving up.

use thiserror::Error;

/// Errors that can occur while talking to the job service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The server returned HTTP 429.
    /// `retry_after_ms` says how long to wait before trying again.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The session or job handle is unknown to the service (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other non-success response (401 bad key, 500 internal error, ...).
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The response body did not have the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Underlying transport failure (DNS, refused connection, timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ServiceError {
    /// Transient failures: network, rate limit and 5xx responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::RateLimited { .. } | ServiceError::Network(_) => true,
            ServiceError::Api { status, .. } => *status >= 500,
            ServiceError::NotFound(_) | ServiceError::Decode(_) => false,
        }
    }

    /// The service rejected the handle; a fresh session is needed.
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = ServiceError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn api_error_display() {
        let err = ServiceError::Api {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid API key");
    }

    #[test]
    fn not_found_is_session_invalid_not_retryable() {
        let err = ServiceError::NotFound("thread_abc".into());
        assert!(err.is_session_invalid());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "not found: thread_abc");
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = ServiceError::Api {
            status: 502,
            message: "bad gateway".into(),
        };
        assert!(err.is_retryable());
        assert!(ServiceError::RateLimited { retry_after_ms: 1 }.is_retryable());
        assert!(!ServiceError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServiceError>();
    }
}
