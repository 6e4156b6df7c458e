use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::error::ExtractorError;
use super::utils::parse_retry_after;

pub(crate) const DEFAULT_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Outcome of a successful extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// A direct, fetchable media URL.
    Direct {
        url: String,
        content_length: Option<u64>,
        /// Height of the selected rendition, when the platform reports it.
        height: Option<u32>,
    },
    /// The platform has no plain media URL (adaptive/segmented or signed);
    /// the caller should hand the page URL to a generic fetcher.
    Delegate { reason: String },
}

impl Extraction {
    pub fn direct(url: impl Into<String>) -> Self {
        Extraction::Direct {
            url: url.into(),
            content_length: None,
            height: None,
        }
    }

    pub fn delegate(reason: impl Into<String>) -> Self {
        Extraction::Delegate {
            reason: reason.into(),
        }
    }

    pub fn direct_url(&self) -> Option<&str> {
        match self {
            Extraction::Direct { url, .. } => Some(url),
            Extraction::Delegate { .. } => None,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        match self {
            Extraction::Direct { content_length, .. } => *content_length,
            Extraction::Delegate { .. } => None,
        }
    }
}

/// A platform-specific strategy that resolves a page URL into media.
#[async_trait]
pub trait PlatformExtractor: Send + Sync {
    /// Stable identifier, used for registration and logging.
    fn name(&self) -> &'static str;

    fn matches(&self, url: &Url) -> bool;

    async fn extract(&self, url: &Url) -> Result<Extraction, ExtractorError>;
}

/// Shared HTTP plumbing for extractors: default headers and status mapping.
#[derive(Debug, Clone)]
pub struct HttpExtractor {
    pub platform_name: &'static str,
    pub client: Client,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpExtractor {
    pub fn new(platform_name: &'static str, client: Client) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(DEFAULT_UA),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json,text/html;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.8"),
        );

        Self {
            platform_name,
            client,
            headers,
            timeout: Duration::from_secs(20),
        }
    }

    pub fn set_header_static(&mut self, name: HeaderName, value: &'static str) {
        self.headers.insert(name, HeaderValue::from_static(value));
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client
            .get(url)
            .headers(self.headers.clone())
            .timeout(self.timeout)
    }

    pub fn head(&self, url: &str) -> RequestBuilder {
        self.client
            .head(url)
            .headers(self.headers.clone())
            .timeout(self.timeout)
    }

    /// Send a request and map failing statuses into extractor errors.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, ExtractorError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExtractorError::Timeout(format!("{}: {e}", self.platform_name))
            } else {
                ExtractorError::HttpError(e)
            }
        })?;
        debug!(
            platform = self.platform_name,
            status = %response.status(),
            url = %response.url(),
            "extractor response"
        );
        check_status(response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ExtractorError> {
        let response = self.send(self.get(url)).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            ExtractorError::structure(format!("{} returned unexpected JSON: {e}", self.platform_name))
        })
    }
}

/// Map an HTTP response status into the extractor error taxonomy.
pub fn check_status(response: Response) -> Result<Response, ExtractorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    Err(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => ExtractorError::NotFound(url),
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => ExtractorError::Private(url),
        StatusCode::TOO_MANY_REQUESTS => ExtractorError::RateLimited {
            retry_after: response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ExtractorError::Timeout(url),
        other => ExtractorError::ServerError {
            status: Some(other.as_u16()),
            message: url,
        },
    })
}
