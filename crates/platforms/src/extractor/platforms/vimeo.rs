use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::extractor::error::ExtractorError;
use crate::extractor::platform_extractor::{Extraction, HttpExtractor, PlatformExtractor};
use crate::extractor::utils::capture_group_1_or_invalid_url;

pub static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.|player\.)?vimeo\.com/(?:video/|channels/[^/]+/)?(\d+)")
        .unwrap()
});

#[derive(Debug, Deserialize)]
struct PlayerConfig {
    #[serde(default)]
    request: Option<RequestSection>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RequestSection {
    files: Files,
}

#[derive(Debug, Deserialize)]
struct Files {
    #[serde(default)]
    progressive: Vec<Progressive>,
    #[serde(default)]
    hls: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Progressive {
    url: String,
    #[serde(default)]
    height: Option<u32>,
}

pub struct Vimeo {
    http: HttpExtractor,
    player_base: String,
}

impl Vimeo {
    pub const NAME: &'static str = "vimeo";
    const PLAYER_BASE: &'static str = "https://player.vimeo.com";

    pub fn new(client: Client) -> Self {
        let mut http = HttpExtractor::new(Self::NAME, client);
        http.set_header_static(reqwest::header::REFERER, "https://vimeo.com/");
        Self {
            http,
            player_base: Self::PLAYER_BASE.to_string(),
        }
    }

    pub fn with_player_base(mut self, base: impl Into<String>) -> Self {
        self.player_base = base.into();
        self
    }

    pub fn video_id(url: &str) -> Result<&str, ExtractorError> {
        capture_group_1_or_invalid_url(&URL_REGEX, url)
    }

    /// Pick the tallest progressive rendition from a player config document.
    fn parse_config(body: &str) -> Result<Extraction, ExtractorError> {
        let config: PlayerConfig = serde_json::from_str(body)?;
        let Some(request) = config.request else {
            let message = config.message.unwrap_or_default();
            return Err(if message.to_ascii_lowercase().contains("private") {
                ExtractorError::Private(message)
            } else {
                ExtractorError::structure(format!("player config without request: {message}"))
            });
        };

        match request
            .files
            .progressive
            .into_iter()
            .max_by_key(|p| p.height.unwrap_or(0))
        {
            Some(best) => Ok(Extraction::Direct {
                url: best.url,
                content_length: None,
                height: best.height,
            }),
            None if request.files.hls.is_some() => {
                Ok(Extraction::delegate("vimeo only offers adaptive streams"))
            }
            None => Err(ExtractorError::structure("no playable files in player config")),
        }
    }
}

#[async_trait]
impl PlatformExtractor for Vimeo {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn matches(&self, url: &Url) -> bool {
        URL_REGEX.is_match(url.as_str())
    }

    async fn extract(&self, url: &Url) -> Result<Extraction, ExtractorError> {
        let id = Self::video_id(url.as_str())?;
        let config_url = format!("{}/video/{id}/config", self.player_base);
        let response = self.http.send(self.http.get(&config_url)).await?;
        let body = response.text().await?;
        Self::parse_config(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_video_id() {
        assert_eq!(Vimeo::video_id("https://vimeo.com/76979871").unwrap(), "76979871");
        assert_eq!(
            Vimeo::video_id("https://player.vimeo.com/video/123?h=abc").unwrap(),
            "123"
        );
        assert_eq!(
            Vimeo::video_id("https://vimeo.com/channels/staffpicks/555").unwrap(),
            "555"
        );
        assert!(Vimeo::video_id("https://vimeo.com/about").is_err());
    }

    #[test]
    fn picks_tallest_progressive_file() {
        let body = r#"{"request":{"files":{"progressive":[
            {"url":"https://cdn/360.mp4","height":360},
            {"url":"https://cdn/1080.mp4","height":1080},
            {"url":"https://cdn/720.mp4","height":720}
        ]}}}"#;
        let extraction = Vimeo::parse_config(body).unwrap();
        assert_eq!(extraction.direct_url(), Some("https://cdn/1080.mp4"));
    }

    #[test]
    fn adaptive_only_delegates() {
        let body = r#"{"request":{"files":{"progressive":[],"hls":{"cdns":{}}}}}"#;
        assert!(matches!(
            Vimeo::parse_config(body).unwrap(),
            Extraction::Delegate { .. }
        ));
    }

    #[test]
    fn private_message_maps_to_private() {
        let body = r#"{"message":"Because of its privacy settings, this video cannot be played here. It is private."}"#;
        let err = Vimeo::parse_config(body).unwrap_err();
        assert!(matches!(err, ExtractorError::Private(_)));
    }
}
