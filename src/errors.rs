//! Client error types.
//!
//! Every fallible operation in the crate returns [`StorageError`].  Service
//! errors are parsed from the JSON error envelope so that the retry engine
//! can classify them by HTTP status and error reason.

use http::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by the storage client.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The service answered with a non-success status and an error body.
    #[error("{message} (HTTP {status})")]
    Api {
        status: StatusCode,
        message: String,
        /// Machine-readable reasons from `error.errors[].reason`.
        reasons: Vec<String>,
        /// Server-requested delay from a `Retry-After` header.
        retry_after: Option<Duration>,
    },

    /// The requested bucket, object, or sub-resource does not exist.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// A generation, metageneration, or etag precondition did not hold.
    #[error("At least one of the pre-conditions you specified did not hold")]
    PreconditionFailed,

    /// The HTTP layer failed before a response was received.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Credentials could not be resolved or exchanged for a token.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A signed URL or policy could not be produced.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// A caller-supplied argument is invalid.
    #[error("{0}")]
    InvalidArgument(String),

    /// A JSON payload could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O failed (file uploads and downloads).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An XML API payload could not be parsed.
    #[error("Malformed XML response: {0}")]
    Xml(String),

    /// The resumable upload session no longer exists on the server.
    #[error("The resumable upload session has expired or was not found")]
    UploadSessionExpired,

    /// The upload session answered 308 without persisting any new bytes.
    #[error("Upload session made no progress past offset {offset}")]
    UploadStalled { offset: u64 },

    /// Downloaded bytes did not match the checksum reported by the service.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    DataCorruption { expected: String, actual: String },

    /// Every allowed attempt failed with a retryable error.
    #[error("Retry budget exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<StorageError>,
    },

    /// The request or the overall operation deadline elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// HTTP status associated with this error, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            StorageError::Api { status, .. } => Some(*status),
            StorageError::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            StorageError::PreconditionFailed => Some(StatusCode::PRECONDITION_FAILED),
            StorageError::Http(e) => e
                .status()
                .and_then(|s| StatusCode::from_u16(s.as_u16()).ok()),
            StorageError::RetriesExhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }

    /// Error reasons reported by the service.
    pub fn reasons(&self) -> &[String] {
        match self {
            StorageError::Api { reasons, .. } => reasons,
            StorageError::RetriesExhausted { last, .. } => last.reasons(),
            _ => &[],
        }
    }

    /// Delay the server asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StorageError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Attach a `Retry-After` delay to a service error.
    pub fn with_retry_after(mut self, delay: Option<Duration>) -> Self {
        if let StorageError::Api { retry_after, .. } = &mut self {
            *retry_after = delay;
        }
        self
    }

    /// Whether the error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(StatusCode::NOT_FOUND)
    }

    /// Build an error from a non-success response status and its body.
    ///
    /// `resource` names the bucket or object for not-found errors.
    pub fn from_response(status: StatusCode, body: &str, resource: &str) -> Self {
        if status == StatusCode::NOT_FOUND {
            return StorageError::NotFound {
                resource: resource.to_string(),
            };
        }
        if status == StatusCode::PRECONDITION_FAILED {
            return StorageError::PreconditionFailed;
        }

        match serde_json::from_str::<ApiErrorResponse>(body) {
            Ok(ApiErrorResponse { error: Some(err) }) => StorageError::Api {
                status,
                message: err
                    .message
                    .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
                reasons: err
                    .errors
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|e| e.reason)
                    .collect(),
                retry_after: None,
            },
            _ => StorageError::Api {
                status,
                message: if body.is_empty() {
                    format!("HTTP {}", status.as_u16())
                } else {
                    format!("HTTP {} - {}", status.as_u16(), body.trim())
                },
                reasons: Vec::new(),
                retry_after: None,
            },
        }
    }
}

impl From<jsonwebtoken::errors::Error> for StorageError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        StorageError::Signing(e.to_string())
    }
}

// -- Service error envelope ---------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    errors: Option<Vec<ApiErrorDetail>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorBody>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_error_with_reasons() {
        let body = r#"{"error":{"code":429,"message":"The rate of change requests to the object is too high","errors":[{"domain":"usageLimits","reason":"rateLimitExceeded","message":"slow down"}]}}"#;
        let err = StorageError::from_response(StatusCode::TOO_MANY_REQUESTS, body, "b/o");
        match &err {
            StorageError::Api {
                status,
                message,
                reasons,
                ..
            } => {
                assert_eq!(*status, StatusCode::TOO_MANY_REQUESTS);
                assert!(message.starts_with("The rate of change"));
                assert_eq!(reasons, &vec!["rateLimitExceeded".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.reasons(), ["rateLimitExceeded".to_string()]);
    }

    #[test]
    fn test_parse_non_json_body() {
        let err = StorageError::from_response(StatusCode::BAD_GATEWAY, "upstream died", "b");
        assert_eq!(err.to_string(), "HTTP 502 - upstream died (HTTP 502 Bad Gateway)");
        assert!(err.reasons().is_empty());
    }

    #[test]
    fn test_empty_error_object() {
        let err = StorageError::from_response(StatusCode::FORBIDDEN, r#"{"error":{}}"#, "b");
        assert_eq!(err.status_code(), Some(StatusCode::FORBIDDEN));
        assert!(err.reasons().is_empty());
    }

    #[test]
    fn test_not_found_mapping() {
        let err = StorageError::from_response(StatusCode::NOT_FOUND, "", "bucket/key.txt");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: bucket/key.txt");
    }

    #[test]
    fn test_precondition_mapping() {
        let err = StorageError::from_response(StatusCode::PRECONDITION_FAILED, "{}", "b/o");
        assert!(matches!(err, StorageError::PreconditionFailed));
        assert_eq!(err.status_code(), Some(StatusCode::PRECONDITION_FAILED));
    }

    #[test]
    fn test_retries_exhausted_delegates_status() {
        let last = StorageError::from_response(StatusCode::SERVICE_UNAVAILABLE, "", "b");
        let err = StorageError::RetriesExhausted {
            attempts: 4,
            last: Box::new(last),
        };
        assert_eq!(err.status_code(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }
}
