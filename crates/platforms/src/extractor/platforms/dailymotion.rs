use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::extractor::error::ExtractorError;
use crate::extractor::platform_extractor::{Extraction, HttpExtractor, PlatformExtractor};

pub static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:(?:www\.)?dailymotion\.com/(?:embed/)?video/|dai\.ly/)([a-zA-Z0-9]+)")
        .unwrap()
});

pub struct Dailymotion {
    http: HttpExtractor,
    api_base: String,
}

impl Dailymotion {
    pub const NAME: &'static str = "dailymotion";
    const API_BASE: &'static str = "https://www.dailymotion.com";

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

    pub fn video_id(url: &str) -> Result<&str, ExtractorError> {
        URL_REGEX
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| ExtractorError::InvalidUrl(url.to_string()))
    }

    fn parse_metadata(doc: &Value) -> Result<Extraction, ExtractorError> {
        if let Some(error) = doc.get("error").filter(|e| !e.is_null()) {
            let code = error.get("code").and_then(Value::as_u64);
            let message = error
                .get("title")
                .or_else(|| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let lowered = message.to_ascii_lowercase();
            return Err(match code {
                Some(404 | 410) => ExtractorError::NotFound(message),
                Some(401 | 403) => ExtractorError::Private(message),
                _ if lowered.contains("private")
                    || lowered.contains("geo")
                    || lowered.contains("not available in your country") =>
                {
                    ExtractorError::Private(message)
                }
                _ if lowered.contains("deleted") || lowered.contains("not found") => {
                    ExtractorError::NotFound(message)
                }
                _ => ExtractorError::ServerError {
                    status: code.and_then(|c| u16::try_from(c).ok()),
                    message,
                },
            });
        }

        let qualities = doc
            .get("qualities")
            .and_then(Value::as_object)
            .ok_or_else(|| ExtractorError::structure("metadata without qualities"))?;

        let mut best: Option<(u32, &str)> = None;
        for (label, entries) in qualities {
            let Ok(height) = label.parse::<u32>() else {
                continue;
            };
            let mp4 = entries.as_array().into_iter().flatten().find(|e| {
                e.get("type").and_then(Value::as_str) == Some("video/mp4")
            });
            if let Some(url) = mp4.and_then(|e| e.get("url")).and_then(Value::as_str)
                && best.is_none_or(|(h, _)| height > h)
            {
                best = Some((height, url));
            }
        }

        match best {
            Some((height, url)) => Ok(Extraction::Direct {
                url: url.to_string(),
                content_length: None,
                height: Some(height),
            }),
            None if qualities.contains_key("auto") => {
                Ok(Extraction::delegate("dailymotion only offers HLS"))
            }
            None => Err(ExtractorError::structure("no usable qualities")),
        }
    }
}

#[async_trait]
impl PlatformExtractor for Dailymotion {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn matches(&self, url: &Url) -> bool {
        URL_REGEX.is_match(url.as_str())
    }

    async fn extract(&self, url: &Url) -> Result<Extraction, ExtractorError> {
        let id = Self::video_id(url.as_str())?;
        let doc: Value = self
            .http
            .get_json(&format!("{}/player/metadata/video/{id}", self.api_base))
            .await?;
        Self::parse_metadata(&doc)
    }
}
