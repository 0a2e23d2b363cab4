use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Closed failure taxonomy of the try-on pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientFunds,
    InvalidImage,
    InvalidRequest,
    Unauthorized,
    RateLimitExceeded,
    TooManyItems,
    StorageError,
    DatabaseError,
    UploadFailed,
    Timeout,
    ProcessingFailed,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientFunds => "insufficient_funds",
            Self::InvalidImage => "invalid_image",
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::TooManyItems => "too_many_items",
            Self::StorageError => "storage_error",
            Self::DatabaseError => "database_error",
            Self::UploadFailed => "upload_failed",
            Self::Timeout => "timeout",
            Self::ProcessingFailed => "processing_failed",
            Self::InternalError => "internal_error",
        }
    }

    /// Client faults never refund: they are rejected before any gem moves.
    pub fn is_client_fault(self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds
                | Self::InvalidImage
                | Self::InvalidRequest
                | Self::Unauthorized
                | Self::RateLimitExceeded
                | Self::TooManyItems
        )
    }

    pub fn should_refund(self) -> bool {
        !self.is_client_fault()
    }

    pub fn status(self) -> u16 {
        match self {
            Self::InsufficientFunds => 402,
            Self::InvalidImage | Self::InvalidRequest | Self::TooManyItems => 400,
            Self::Unauthorized => 401,
            Self::RateLimitExceeded => 429,
            Self::StorageError
            | Self::DatabaseError
            | Self::ProcessingFailed
            | Self::InternalError => 500,
            Self::UploadFailed => 502,
            Self::Timeout => 504,
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::InsufficientFunds => "You don't have enough gems for this request.",
            Self::InvalidImage => "One of the images is not a valid JPEG or PNG under 10 MB.",
            Self::InvalidRequest => "The request is missing required information.",
            Self::Unauthorized => "Please sign in again to continue.",
            Self::RateLimitExceeded => "Too many requests. Please wait a moment and try again.",
            Self::TooManyItems => "Too many clothing items. Select at most 5.",
            Self::StorageError => "We couldn't store your images.",
            Self::DatabaseError => "Something went wrong saving your request.",
            Self::UploadFailed => "We couldn't upload your images.",
            Self::Timeout => "Generation took too long.",
            Self::ProcessingFailed => "Generation failed.",
            Self::InternalError => "An unexpected error occurred.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline failure, classified once at the point it is raised.
///
/// `detail` is for operators and logs only; it never reaches the user.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct TryOnError {
    pub kind: ErrorKind,
    pub detail: String,
    pub status_override: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl TryOnError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            status_override: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_override = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, detail)
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, detail)
    }

    pub fn processing(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProcessingFailed, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, detail)
    }

    pub fn status(&self) -> u16 {
        self.status_override.unwrap_or_else(|| self.kind.status())
    }
}

/// Structured error returned to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_kind: ErrorKind,
    pub user_message: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub refunded: bool,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.error_kind, self.status, self.user_message)
    }
}

impl std::error::Error for ErrorResponse {}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorKind; 12] = [
        ErrorKind::InsufficientFunds,
        ErrorKind::InvalidImage,
        ErrorKind::InvalidRequest,
        ErrorKind::Unauthorized,
        ErrorKind::RateLimitExceeded,
        ErrorKind::TooManyItems,
        ErrorKind::StorageError,
        ErrorKind::DatabaseError,
        ErrorKind::UploadFailed,
        ErrorKind::Timeout,
        ErrorKind::ProcessingFailed,
        ErrorKind::InternalError,
    ];

    #[test]
    fn client_faults_are_below_500_and_never_refund() {
        for kind in ALL {
            if kind.is_client_fault() {
                assert!(kind.status() < 500, "{kind}");
                assert!(!kind.should_refund(), "{kind}");
            } else {
                assert!(kind.status() >= 500, "{kind}");
                assert!(kind.should_refund(), "{kind}");
            }
        }
        assert_eq!(ErrorKind::Timeout.status(), 504);
    }

    #[test]
    fn status_override_wins() {
        let err = TryOnError::new(ErrorKind::InvalidImage, "too big").with_status(413);
        assert_eq!(err.status(), 413);
        assert_eq!(err.kind.status(), 400);
    }

    #[test]
    fn user_messages_do_not_leak_detail() {
        let err = TryOnError::processing("upstream said: /srv/app/secret.rs:12 panic");
        assert!(!err.kind.user_message().contains("secret"));
        assert!(err.to_string().contains("processing_failed"));
    }
}
