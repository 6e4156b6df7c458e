//! Failure classification results handed from pipelines to the worker.

use std::time::Duration;

/// Taxonomy of pipeline failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum FailureCategory {
    /// Timeouts, connection resets.
    Transient,
    /// Site markup or API shape changed.
    PlatformStructural,
    /// Deleted, private, login-required, geo-blocked.
    ContentState,
    /// Size ceiling, disk quota, checksum mismatch.
    ResourceLimit,
    RateLimit,
    /// Explicitly marked as not worth retrying.
    SkipRetry,
    Unknown,
}

impl FailureCategory {
    pub fn is_retryable(self) -> bool {
        match self {
            FailureCategory::Transient
            | FailureCategory::PlatformStructural
            | FailureCategory::RateLimit
            | FailureCategory::Unknown => true,
            FailureCategory::ContentState
            | FailureCategory::ResourceLimit
            | FailureCategory::SkipRetry => false,
        }
    }
}

/// A failure with its retry decision already made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{category}] {}", self.error_text())]
pub struct ClassifiedFailure {
    pub category: FailureCategory,
    pub retryable: bool,
    /// Replaces the default backoff schedule (rate-limit hints).
    pub backoff_override: Option<Duration>,
    /// User-facing advice for terminal failures.
    pub recommendation: Option<String>,
    pub message: String,
}

impl ClassifiedFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            retryable: category.is_retryable(),
            backoff_override: None,
            recommendation: None,
            message: message.into(),
        }
    }

    pub fn with_backoff(mut self, backoff: Option<Duration>) -> Self {
        self.backoff_override = backoff;
        self
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = Some(recommendation.into());
        self
    }

    /// Text stored in the job's `error` column.
    pub fn error_text(&self) -> String {
        match &self.recommendation {
            Some(rec) => format!("{} ({rec})", self.message),
            None => self.message.clone(),
        }
    }
}
