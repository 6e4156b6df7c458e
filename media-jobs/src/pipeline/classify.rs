//! Turns a [`PipelineError`] into a retry decision.
//!
//! Typed errors are matched first. Free-form tool and service messages fall
//! back to keyword patterns. Terminal failures get a user-facing
//! recommendation derived from the source platform.

use std::io::ErrorKind;

use platforms_parser::{ExtractorError, ExtractorErrorKind, Platform};

use super::error::PipelineError;
use crate::domain::{ClassifiedFailure, FailureCategory};
use crate::download::DownloadError;

/// Explicit marker a component can put in a message to forbid retries.
pub const SKIP_RETRY_MARKER: &str = "[skip-retry]";

const RESOURCE_PATTERNS: &[&str] = &[
    "exceeds maximum size",
    "larger than max-filesize",
    "no space left",
    "disk quota",
    "checksum mismatch",
];

const SKIP_PATTERNS: &[&str] = &[SKIP_RETRY_MARKER, "not implemented", "not yet implemented"];

const CONTENT_PATTERNS: &[&str] = &[
    "private video",
    "video is private",
    "video unavailable",
    "this video is unavailable",
    "has been removed",
    "was deleted",
    "sign in to confirm",
    "login required",
    "log in to",
    "members-only",
    "geo-blocked",
    "geo restricted",
    "not available in your country",
];

const RATE_PATTERNS: &[&str] = &["429", "too many requests", "rate limit", "rate-limit"];

const NETWORK_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "econnreset",
    "etimedout",
    "network",
    "dns error",
    "temporarily unavailable",
    "unexpected eof",
    "error sending request",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Keyword classification for free-form messages.
pub fn classify_message(message: &str) -> Option<FailureCategory> {
    let msg = message.to_ascii_lowercase();
    if contains_any(&msg, SKIP_PATTERNS) {
        Some(FailureCategory::SkipRetry)
    } else if contains_any(&msg, RESOURCE_PATTERNS) {
        Some(FailureCategory::ResourceLimit)
    } else if contains_any(&msg, CONTENT_PATTERNS) {
        Some(FailureCategory::ContentState)
    } else if contains_any(&msg, RATE_PATTERNS) {
        Some(FailureCategory::RateLimit)
    } else if contains_any(&msg, NETWORK_PATTERNS) {
        Some(FailureCategory::Transient)
    } else {
        None
    }
}

fn classify_status(status: u16) -> FailureCategory {
    match status {
        429 => FailureCategory::RateLimit,
        401 | 403 | 404 | 410 | 451 => FailureCategory::ContentState,
        408 | 500..=599 => FailureCategory::Transient,
        _ => FailureCategory::Unknown,
    }
}

fn classify_io(kind: ErrorKind, message: &str) -> FailureCategory {
    match kind {
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded | ErrorKind::FileTooLarge => {
            FailureCategory::ResourceLimit
        }
        ErrorKind::UnexpectedEof
        | ErrorKind::TimedOut
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::Interrupted => FailureCategory::Transient,
        _ => classify_message(message).unwrap_or(FailureCategory::Unknown),
    }
}

fn classify_extraction(e: &ExtractorError) -> FailureCategory {
    if let ExtractorError::RateLimited { .. } = e {
        return FailureCategory::RateLimit;
    }
    match e.kind() {
        ExtractorErrorKind::NotFound | ExtractorErrorKind::Private => FailureCategory::ContentState,
        ExtractorErrorKind::StructureChanged => FailureCategory::PlatformStructural,
        ExtractorErrorKind::Timeout => FailureCategory::Transient,
        ExtractorErrorKind::ServerError => match e.status() {
            Some(status) => classify_status(status),
            None => FailureCategory::Transient,
        },
    }
}

fn classify_download(e: &DownloadError) -> FailureCategory {
    match e.root() {
        DownloadError::SizeExceeded { .. } => FailureCategory::ResourceLimit,
        DownloadError::Http { status, .. } => classify_status(*status),
        DownloadError::Network(err) => match err.status() {
            Some(status) => classify_status(status.as_u16()),
            None => FailureCategory::Transient,
        },
        DownloadError::Redirect(_) => FailureCategory::Transient,
        DownloadError::Io(err) => classify_io(err.kind(), &err.to_string()),
        DownloadError::Tool { message, .. } => {
            classify_message(message).unwrap_or(FailureCategory::Unknown)
        }
        DownloadError::Unsupported { .. } | DownloadError::AllStrategiesFailed { .. } => {
            FailureCategory::Unknown
        }
    }
}

fn category_of(error: &PipelineError) -> FailureCategory {
    match error {
        PipelineError::Extraction { source, .. } => classify_extraction(source),
        PipelineError::Download(e) => classify_download(e),
        PipelineError::Tool { message, .. } => {
            classify_message(message).unwrap_or(FailureCategory::Unknown)
        }
        PipelineError::Service {
            status, message, ..
        } => match status {
            Some(401 | 403) => FailureCategory::SkipRetry,
            Some(s) => classify_status(*s),
            None => classify_message(message).unwrap_or(FailureCategory::Transient),
        },
        PipelineError::Store(e) => match e {
            crate::Error::Io(io) => classify_io(io.kind(), &io.to_string()),
            _ => FailureCategory::Transient,
        },
        PipelineError::Checkpoint(_) => FailureCategory::Unknown,
        PipelineError::InvalidInput(_)
        | PipelineError::NotImplemented(_)
        | PipelineError::Cancelled => FailureCategory::SkipRetry,
        PipelineError::Io(e) => classify_io(e.kind(), &e.to_string()),
    }
}

fn backoff_hint(error: &PipelineError) -> Option<std::time::Duration> {
    match error {
        PipelineError::Extraction { source, .. } => source.retry_after(),
        PipelineError::Download(e) => e.retry_after(),
        PipelineError::Service { retry_after, .. } => *retry_after,
        _ => None,
    }
}

/// User-facing advice for a failure on `platform`.
pub fn platform_advisory(platform: Platform, category: FailureCategory) -> Option<String> {
    let site = platform.display_name();
    match category {
        FailureCategory::ContentState if platform.requires_login_often() => Some(format!(
            "{site} requires a login for this video; no retry possible"
        )),
        FailureCategory::ContentState => Some(format!(
            "video is private, removed or region-locked on {site}; no retry possible"
        )),
        FailureCategory::ResourceLimit => Some(
            "source exceeds the allowed download size; pick a lower quality or a trusted source"
                .to_string(),
        ),
        FailureCategory::PlatformStructural => Some(format!(
            "{site} changed its page layout; the extractor may need an update"
        )),
        FailureCategory::SkipRetry => Some("fix the job input and retry manually".to_string()),
        FailureCategory::Transient | FailureCategory::RateLimit | FailureCategory::Unknown => None,
    }
}

/// Classify a phase failure. `source_url` selects the platform advisory.
pub fn classify(error: &PipelineError, source_url: Option<&str>) -> ClassifiedFailure {
    let category = category_of(error);
    let mut failure =
        ClassifiedFailure::new(category, error.to_string()).with_backoff(backoff_hint(error));

    let platform = match error {
        PipelineError::Extraction { platform, .. } => platform
            .parse::<Platform>()
            .unwrap_or_else(|_| source_url.map_or(Platform::Generic, Platform::detect_str)),
        _ => source_url.map_or(Platform::Generic, Platform::detect_str),
    };
    if let Some(advice) = platform_advisory(platform, category) {
        failure = failure.with_recommendation(advice);
    }
    failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn private_extraction_is_terminal_with_advice() {
        let err = PipelineError::Extraction {
            platform: "vimeo".into(),
            source: ExtractorError::Private("password protected".into()),
        };
        let f = classify(&err, Some("https://vimeo.com/1"));
        assert_eq!(f.category, FailureCategory::ContentState);
        assert!(!f.retryable);
        assert!(f.error_text().contains("Vimeo"));
        assert!(f.error_text().contains("no retry possible"));
    }

    #[test]
    fn structure_change_is_retryable() {
        let err = PipelineError::Extraction {
            platform: "dailymotion".into(),
            source: ExtractorError::structure("no qualities"),
        };
        let f = classify(&err, None);
        assert_eq!(f.category, FailureCategory::PlatformStructural);
        assert!(f.retryable);
    }

    #[test]
    fn rate_limit_carries_backoff() {
        let err = PipelineError::Download(DownloadError::Http {
            status: 429,
            url: "https://cdn.example.com/x".into(),
            retry_after: Some(Duration::from_secs(120)),
        });
        let f = classify(&err, None);
        assert_eq!(f.category, FailureCategory::RateLimit);
        assert!(f.retryable);
        assert_eq!(f.backoff_override, Some(Duration::from_secs(120)));
    }

    #[test]
    fn size_limit_is_terminal_even_inside_a_chain_summary() {
        let err = PipelineError::Download(DownloadError::SizeExceeded {
            limit: 1,
            declared: Some(2),
            received: 0,
        });
        assert_eq!(classify(&err, None).category, FailureCategory::ResourceLimit);

        let tool = PipelineError::tool("ffmpeg", "No space left on device");
        assert!(!classify(&tool, None).retryable);
    }

    #[test]
    fn message_patterns() {
        assert_eq!(
            classify_message("ERROR: [youtube] abc: Private video. Sign in"),
            Some(FailureCategory::ContentState)
        );
        assert_eq!(
            classify_message("error sending request: connection reset by peer"),
            Some(FailureCategory::Transient)
        );
        assert_eq!(
            classify_message("voice cloning [skip-retry]"),
            Some(FailureCategory::SkipRetry)
        );
        assert_eq!(classify_message("segfault"), None);
    }

    #[test]
    fn network_errors_without_status_are_transient() {
        let err = PipelineError::Download(DownloadError::AllStrategiesFailed {
            attempts: vec![],
            last: Box::new(DownloadError::Redirect("too many redirects".into())),
        });
        assert_eq!(classify(&err, None).category, FailureCategory::Transient);
    }

    #[test]
    fn login_walled_platforms_get_specific_advice() {
        let err = PipelineError::tool("yt-dlp", "login required");
        let f = classify(&err, Some("https://www.instagram.com/reel/x"));
        assert_eq!(f.category, FailureCategory::ContentState);
        assert!(f.error_text().contains("requires a login"));
    }
}
