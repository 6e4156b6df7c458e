use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::extractor::error::ExtractorError;
use crate::extractor::platform_extractor::{Extraction, HttpExtractor, PlatformExtractor};
use crate::extractor::utils::{absolutize, capture_group_1_or_invalid_url, json_u64};

pub static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.)?streamable\.com/(?:[eo]/)?([a-zA-Z0-9]+)").unwrap()
});

// Streamable reports 2 once transcoding has finished.
const STATUS_READY: u64 = 2;

pub struct Streamable {
    http: HttpExtractor,
    api_base: String,
}

impl Streamable {
    pub const NAME: &'static str = "streamable";
    const API_BASE: &'static str = "https://api.streamable.com";

    pub fn new(client: Client) -> Self {
        Self {
            http: HttpExtractor::new(Self::NAME, client),
            api_base: Self::API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn shortcode(url: &str) -> Result<&str, ExtractorError> {
        capture_group_1_or_invalid_url(&URL_REGEX, url)
    }

    fn parse_video(doc: &Value) -> Result<Extraction, ExtractorError> {
        let status = json_u64(doc.get("status"));
        if status.is_some_and(|s| s < STATUS_READY) {
            return Err(ExtractorError::ServerError {
                status: None,
                message: "video is still processing".to_string(),
            });
        }

        let files = doc
            .get("files")
            .and_then(Value::as_object)
            .ok_or_else(|| ExtractorError::structure("video without files"))?;

        let file = files
            .get("mp4")
            .or_else(|| files.get("mp4-mobile"))
            .ok_or_else(|| ExtractorError::structure("no mp4 rendition"))?;

        let url = file
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ExtractorError::structure("mp4 rendition without url"))?;

        Ok(Extraction::Direct {
            url: absolutize(url),
            content_length: json_u64(file.get("size")),
            height: json_u64(file.get("height")).and_then(|h| u32::try_from(h).ok()),
        })
    }
}

#[async_trait]
impl PlatformExtractor for Streamable {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn matches(&self, url: &Url) -> bool {
        URL_REGEX.is_match(url.as_str())
    }

    async fn extract(&self, url: &Url) -> Result<Extraction, ExtractorError> {
        let code = Self::shortcode(url.as_str())?;
        let doc: Value = self
            .http
            .get_json(&format!("{}/videos/{code}", self.api_base))
            .await?;
        Self::parse_video(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ready_video() {
        let doc = json!({
            "status": 2,
            "files": {
                "mp4": {"url": "//cdn-cf-east.streamable.com/video/mp4/abc.mp4", "size": 1048576, "height": 720}
            }
        });
        let extraction = Streamable::parse_video(&doc).unwrap();
        assert_eq!(
            extraction,
            Extraction::Direct {
                url: "https://cdn-cf-east.streamable.com/video/mp4/abc.mp4".into(),
                content_length: Some(1_048_576),
                height: Some(720),
            }
        );
    }

    #[test]
    fn processing_video_is_retryable_server_error() {
        let doc = json!({"status": 1, "files": {}});
        let err = Streamable::parse_video(&doc).unwrap_err();
        assert!(err.kind().is_retryable());
    }

    #[test]
    fn falls_back_to_mobile_rendition() {
        let doc = json!({"status": 2, "files": {"mp4-mobile": {"url": "https://cdn/m.mp4"}}});
        assert_eq!(
            Streamable::parse_video(&doc).unwrap().direct_url(),
            Some("https://cdn/m.mp4")
        );
    }

    #[test]
    fn shortcode_from_embed_url() {
        assert_eq!(Streamable::shortcode("https://streamable.com/e/ab12c").unwrap(), "ab12c");
    }
}
