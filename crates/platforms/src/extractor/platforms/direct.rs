use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::extractor::error::ExtractorError;
use crate::extractor::platform_extractor::{Extraction, HttpExtractor, PlatformExtractor};

const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mov", "webm", "mkv", "avi", "flv", "ts", "mp3", "m4a", "aac", "wav", "ogg",
    "opus",
];

/// Handles URLs that already point at a media file.
///
/// A HEAD request confirms the file is reachable and discovers its size.
pub struct DirectFile {
    http: HttpExtractor,
}

impl DirectFile {
    pub const NAME: &'static str = "direct";

    pub fn new(client: Client) -> Self {
        Self {
            http: HttpExtractor::new(Self::NAME, client),
        }
    }

    pub fn is_media_path(url: &Url) -> bool {
        url.path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|last| last.rsplit_once('.'))
            .is_some_and(|(_, ext)| {
                MEDIA_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }
}

#[async_trait]
impl PlatformExtractor for DirectFile {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn matches(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https") && Self::is_media_path(url)
    }

    async fn extract(&self, url: &Url) -> Result<Extraction, ExtractorError> {
        let response = self.http.send(self.http.head(url.as_str())).await?;
        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        debug!(%url, ?content_length, "direct media file reachable");

        Ok(Extraction::Direct {
            url: response.url().to_string(),
            content_length,
            height: None,
        })
    }
}
