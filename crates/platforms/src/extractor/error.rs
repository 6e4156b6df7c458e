use std::time::Duration;

use thiserror::Error;

/// Closed set of extraction failure kinds callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ExtractorErrorKind {
    NotFound,
    Private,
    StructureChanged,
    Timeout,
    ServerError,
}

impl ExtractorErrorKind {
    /// Whether re-running the extraction later can plausibly succeed.
    pub fn is_retryable(self) -> bool {
        match self {
            ExtractorErrorKind::NotFound | ExtractorErrorKind::Private => false,
            ExtractorErrorKind::StructureChanged
            | ExtractorErrorKind::Timeout
            | ExtractorErrorKind::ServerError => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("video not found: {0}")]
    NotFound(String),
    #[error("video is private or unavailable in this region: {0}")]
    Private(String),
    #[error("page structure changed: {0}")]
    StructureChanged(String),
    #[error("extraction timed out: {0}")]
    Timeout(String),
    #[error("server error (status {status:?}): {message}")]
    ServerError { status: Option<u16>, message: String },
    #[error("rate limited by platform")]
    RateLimited { retry_after: Option<Duration> },
    #[error("http error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl ExtractorError {
    pub fn kind(&self) -> ExtractorErrorKind {
        match self {
            ExtractorError::InvalidUrl(_) | ExtractorError::NotFound(_) => {
                ExtractorErrorKind::NotFound
            }
            ExtractorError::Private(_) => ExtractorErrorKind::Private,
            ExtractorError::StructureChanged(_) | ExtractorError::JsonError(_) => {
                ExtractorErrorKind::StructureChanged
            }
            ExtractorError::Timeout(_) => ExtractorErrorKind::Timeout,
            ExtractorError::ServerError { .. } | ExtractorError::RateLimited { .. } => {
                ExtractorErrorKind::ServerError
            }
            ExtractorError::HttpError(e) => {
                if e.is_timeout() {
                    ExtractorErrorKind::Timeout
                } else if e.is_decode() {
                    ExtractorErrorKind::StructureChanged
                } else {
                    match e.status().map(|s| s.as_u16()) {
                        Some(404 | 410) => ExtractorErrorKind::NotFound,
                        Some(401 | 403 | 451) => ExtractorErrorKind::Private,
                        _ => ExtractorErrorKind::ServerError,
                    }
                }
            }
        }
    }

    /// Platform supplied backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExtractorError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status attached to the failure, when one was observed.
    pub fn status(&self) -> Option<u16> {
        match self {
            ExtractorError::ServerError { status, .. } => *status,
            ExtractorError::RateLimited { .. } => Some(429),
            ExtractorError::HttpError(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn structure(msg: impl Into<String>) -> Self {
        ExtractorError::StructureChanged(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_state_kinds_are_not_retryable() {
        assert!(!ExtractorError::Private("x".into()).kind().is_retryable());
        assert!(!ExtractorError::NotFound("x".into()).kind().is_retryable());
        assert!(!ExtractorError::InvalidUrl("x".into()).kind().is_retryable());
        assert!(ExtractorError::structure("x").kind().is_retryable());
        assert!(
            ExtractorError::RateLimited { retry_after: None }
                .kind()
                .is_retryable()
        );
    }

    #[test]
    fn kind_renders_kebab_case() {
        assert_eq!(ExtractorErrorKind::StructureChanged.to_string(), "structure-changed");
        assert_eq!(ExtractorErrorKind::Private.as_ref(), "private");
    }

    #[test]
    fn rate_limit_carries_hint() {
        let err = ExtractorError::RateLimited {
            retry_after: Some(Duration::from_secs(90)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(90)));
        assert_eq!(err.status(), Some(429));
    }
}
