//! Download strategy chain.
//!
//! Strategies are tried in order (parallel ranges, single stream, then the
//! platform-aware generic fetcher). Each writes to its own partial file so a
//! failed attempt never leaks half a file into the next mechanism.

pub mod error;
pub mod generic;
pub mod parallel;
pub mod streaming;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Response;
use reqwest::header::RETRY_AFTER;
use tracing::{debug, info, warn};
use url::Url;

pub use error::DownloadError;
pub use generic::GenericFetcher;
pub use parallel::ParallelRangeFetcher;
pub use streaming::StreamingFetcher;

use crate::config::{DownloadConfig, ToolConfig};
use crate::queue::TransferSnapshot;
use crate::utils::fs::remove_file_if_exists;

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Progress callback invoked from inside a transfer.
pub type ProgressSink = Arc<dyn Fn(TransferSnapshot) + Send + Sync>;

/// Byte ceiling for one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimit {
    pub max_bytes: u64,
    pub trusted: bool,
}

impl SizeLimit {
    /// Trusted hosts (and their subdomains) get the higher ceiling.
    pub fn for_url(url: &Url, config: &DownloadConfig) -> Self {
        let trusted = url.host_str().is_some_and(|host| {
            let host = host.to_ascii_lowercase();
            config
                .trusted_hosts
                .iter()
                .any(|t| host == *t || host.ends_with(&format!(".{t}")))
        });
        Self {
            max_bytes: if trusted {
                config.max_bytes_trusted
            } else {
                config.max_bytes_untrusted
            },
            trusted,
        }
    }

    /// Reject before any byte is written.
    pub fn check_declared(&self, declared: Option<u64>) -> Result<()> {
        match declared {
            Some(len) if len > self.max_bytes => Err(DownloadError::SizeExceeded {
                limit: self.max_bytes,
                declared,
                received: 0,
            }),
            _ => Ok(()),
        }
    }

    /// Abort mid-transfer once more than the ceiling has arrived.
    pub fn check_received(&self, declared: Option<u64>, received: u64) -> Result<()> {
        if received > self.max_bytes {
            return Err(DownloadError::SizeExceeded {
                limit: self.max_bytes,
                declared,
                received,
            });
        }
        Ok(())
    }
}

/// What to fetch.
#[derive(Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub limit: SizeLimit,
    /// Height cap for sources that offer several renditions.
    pub max_height: Option<u32>,
    /// The URL is a platform page, not a media file. Only page-capable
    /// strategies are tried.
    pub page_url: bool,
    pub progress: ProgressSink,
}

impl FetchRequest {
    pub fn new(url: Url, limit: SizeLimit) -> Self {
        Self {
            url,
            limit,
            max_height: None,
            page_url: false,
            progress: Arc::new(|_| {}),
        }
    }

    pub fn with_max_height(mut self, max_height: Option<u32>) -> Self {
        self.max_height = max_height;
        self
    }

    pub fn page(mut self) -> Self {
        self.page_url = true;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }
}

impl std::fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("url", &self.url.as_str())
            .field("limit", &self.limit)
            .field("max_height", &self.max_height)
            .field("page_url", &self.page_url)
            .finish()
    }
}

#[async_trait]
pub trait DownloadStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a partial file left by a failed attempt can be continued by
    /// this same strategy next time.
    fn supports_resume(&self) -> bool {
        false
    }

    /// Whether this strategy understands platform page URLs.
    fn handles_pages(&self) -> bool {
        false
    }

    /// Write the complete file to `dest`; returns its size.
    async fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub strategy: &'static str,
    pub bytes: u64,
}

/// Ordered fallback over [`DownloadStrategy`] implementations.
#[derive(Clone, Default)]
pub struct DownloadChain {
    strategies: Vec<Arc<dyn DownloadStrategy>>,
}

impl DownloadChain {
    pub fn new(strategies: Vec<Arc<dyn DownloadStrategy>>) -> Self {
        Self { strategies }
    }

    /// Parallel, streaming, then generic.
    pub fn standard(
        client: reqwest::Client,
        download: &DownloadConfig,
        tools: &ToolConfig,
    ) -> Self {
        let parallel: Arc<dyn DownloadStrategy> = Arc::new(ParallelRangeFetcher::new(
            client.clone(),
            download.parallel_connections,
            download.parallel_min_bytes,
        ));
        let streaming: Arc<dyn DownloadStrategy> = Arc::new(StreamingFetcher::new(client));
        let generic: Arc<dyn DownloadStrategy> =
            Arc::new(GenericFetcher::new(&tools.ytdlp, tools.tool_timeout));
        Self::new(vec![parallel, streaming, generic])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn partial_path(dest: &Path, strategy: &str) -> PathBuf {
        let mut name = dest
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{strategy}.part"));
        dest.with_file_name(name)
    }

    pub async fn download(&self, request: &FetchRequest, dest: &Path) -> Result<DownloadOutcome> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut attempts: Vec<(&'static str, String)> = Vec::new();
        let mut last: Option<DownloadError> = None;

        for strategy in &self.strategies {
            let name = strategy.name();
            if request.page_url && !strategy.handles_pages() {
                continue;
            }
            let partial = Self::partial_path(dest, name);
            debug!(strategy = name, url = %request.url, "trying download strategy");

            match strategy.fetch(request, &partial).await {
                Ok(bytes) => {
                    tokio::fs::rename(&partial, dest).await?;
                    info!(strategy = name, bytes, "download finished");
                    return Ok(DownloadOutcome {
                        strategy: name,
                        bytes,
                    });
                }
                Err(e) => {
                    if e.aborts_chain() || !strategy.supports_resume() {
                        if let Err(rm) = remove_file_if_exists(&partial).await {
                            warn!(strategy = name, error = %rm, "failed to remove partial file");
                        }
                    }
                    if e.aborts_chain() {
                        warn!(strategy = name, error = %e, "download aborted");
                        return Err(e);
                    }
                    match &e {
                        DownloadError::Unsupported { .. } => {
                            debug!(strategy = name, error = %e, "strategy skipped")
                        }
                        _ => warn!(strategy = name, error = %e, "download strategy failed"),
                    }
                    attempts.push((name, e.to_string()));
                    last = Some(e);
                }
            }
        }

        let last = last.unwrap_or(DownloadError::Unsupported {
            strategy: "chain",
            reason: "no strategy accepts this source".to_string(),
        });
        Err(DownloadError::AllStrategiesFailed {
            attempts,
            last: Box::new(last),
        })
    }
}

/// Turn a non-success response into a [`DownloadError`]. A 3xx left over
/// after redirect handling means the target was missing or malformed.
pub(crate) fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    if status.is_redirection() {
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("<missing>")
            .to_string();
        return Err(DownloadError::Redirect(format!(
            "HTTP {} from {url} with unusable location {location:?}",
            status.as_u16()
        )));
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(std::time::Duration::from_secs);
    Err(DownloadError::Http {
        status: status.as_u16(),
        url,
        retry_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        name: &'static str,
        result: Mutex<Option<Result<u64>>>,
        calls: Mutex<u32>,
        resume: bool,
    }

    impl Scripted {
        fn new(name: &'static str, result: Result<u64>) -> Arc<Self> {
            Arc::new(Self {
                name,
                result: Mutex::new(Some(result)),
                calls: Mutex::new(0),
                resume: false,
            })
        }
    }

    #[async_trait]
    impl DownloadStrategy for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports_resume(&self) -> bool {
            self.resume
        }

        async fn fetch(&self, _request: &FetchRequest, dest: &Path) -> Result<u64> {
            *self.calls.lock().unwrap() += 1;
            tokio::fs::write(dest, b"partial").await?;
            self.result.lock().unwrap().take().unwrap()
        }
    }

    fn request() -> FetchRequest {
        FetchRequest::new(
            Url::parse("https://cdn.example.com/v.mp4").unwrap(),
            SizeLimit {
                max_bytes: 100,
                trusted: false,
            },
        )
    }

    #[tokio::test]
    async fn falls_through_and_cleans_partials() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("raw.mp4");
        let first = Scripted::new(
            "first",
            Err(DownloadError::Unsupported {
                strategy: "first",
                reason: "no ranges".into(),
            }),
        );
        let second = Scripted::new("second", Ok(7));
        let chain = DownloadChain::new(vec![first.clone() as Arc<dyn DownloadStrategy>, second.clone()]);

        let outcome = chain.download(&request(), &dest).await.unwrap();
        assert_eq!(outcome.strategy, "second");
        assert!(dest.exists());
        assert!(!DownloadChain::partial_path(&dest, "first").exists());
        assert_eq!(*first.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn size_violation_stops_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("raw.mp4");
        let first = Scripted::new(
            "first",
            Err(DownloadError::SizeExceeded {
                limit: 100,
                declared: None,
                received: 101,
            }),
        );
        let second = Scripted::new("second", Ok(7));
        let chain = DownloadChain::new(vec![first as Arc<dyn DownloadStrategy>, second.clone()]);

        let err = chain.download(&request(), &dest).await.unwrap_err();
        assert!(matches!(err, DownloadError::SizeExceeded { .. }));
        assert_eq!(*second.calls.lock().unwrap(), 0);
        assert!(!DownloadChain::partial_path(&dest, "first").exists());
    }

    #[tokio::test]
    async fn page_urls_skip_plain_fetchers() {
        let dir = tempfile::tempdir().unwrap();
        let plain = Scripted::new("plain", Ok(1));
        let chain = DownloadChain::new(vec![plain.clone() as Arc<dyn DownloadStrategy>]);
        let err = chain
            .download(&request().page(), &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::AllStrategiesFailed { .. }));
        assert_eq!(*plain.calls.lock().unwrap(), 0);
    }

    #[test]
    fn trusted_hosts_include_subdomains() {
        let config = DownloadConfig {
            trusted_hosts: vec!["assets.example.com".into()],
            max_bytes_trusted: 1000,
            max_bytes_untrusted: 10,
            ..DownloadConfig::default()
        };
        let inside = Url::parse("https://eu.assets.example.com/a.mp4").unwrap();
        let outside = Url::parse("https://evilassets.example.com/a.mp4").unwrap();
        assert_eq!(SizeLimit::for_url(&inside, &config).max_bytes, 1000);
        assert_eq!(SizeLimit::for_url(&outside, &config).max_bytes, 10);
        assert!(SizeLimit::for_url(&outside, &config).check_declared(Some(11)).is_err());
    }
}
