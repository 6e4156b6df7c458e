use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download exceeds maximum size of {limit} bytes (declared {declared:?}, received {received})")]
    SizeExceeded {
        limit: u64,
        declared: Option<u64>,
        received: u64,
    },

    #[error("HTTP {status} fetching {url}")]
    Http {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("redirect failed: {0}")]
    Redirect(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    /// The strategy cannot handle this source; the chain moves on.
    #[error("{strategy} cannot handle this source: {reason}")]
    Unsupported {
        strategy: &'static str,
        reason: String,
    },

    #[error("all download strategies failed: {}", summarize(.attempts))]
    AllStrategiesFailed {
        attempts: Vec<(&'static str, String)>,
        last: Box<DownloadError>,
    },
}

fn summarize(attempts: &[(&'static str, String)]) -> String {
    attempts
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DownloadError {
    /// Errors that no other strategy can fix.
    pub fn aborts_chain(&self) -> bool {
        matches!(self, DownloadError::SizeExceeded { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DownloadError::Http { status, .. } => Some(*status),
            DownloadError::Network(e) => e.status().map(|s| s.as_u16()),
            DownloadError::AllStrategiesFailed { last, .. } => last.status(),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DownloadError::Http { retry_after, .. } => *retry_after,
            DownloadError::AllStrategiesFailed { last, .. } => last.retry_after(),
            _ => None,
        }
    }

    /// The error that decided the outcome, looking through chain summaries.
    pub fn root(&self) -> &DownloadError {
        match self {
            DownloadError::AllStrategiesFailed { last, .. } => last.root(),
            other => other,
        }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_redirect() {
            DownloadError::Redirect(e.to_string())
        } else {
            DownloadError::Network(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_message_is_recognisable() {
        let e = DownloadError::SizeExceeded {
            limit: 10,
            declared: Some(11),
            received: 0,
        };
        assert!(e.to_string().contains("exceeds maximum size"));
        assert!(e.aborts_chain());
    }

    #[test]
    fn chain_summary_exposes_last_error() {
        let e = DownloadError::AllStrategiesFailed {
            attempts: vec![("parallel", "x".into()), ("streaming", "y".into())],
            last: Box::new(DownloadError::Http {
                status: 429,
                url: "u".into(),
                retry_after: Some(Duration::from_secs(9)),
            }),
        };
        assert_eq!(e.status(), Some(429));
        assert_eq!(e.retry_after(), Some(Duration::from_secs(9)));
        assert!(e.to_string().contains("parallel: x; streaming: y"));
        assert!(matches!(e.root(), DownloadError::Http { .. }));
    }
}
