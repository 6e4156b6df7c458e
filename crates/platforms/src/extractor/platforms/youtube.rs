use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use url::Url;

use crate::extractor::error::ExtractorError;
use crate::extractor::platform_extractor::{Extraction, PlatformExtractor};
use crate::extractor::utils::host_matches;

static VIDEO_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap());

/// YouTube streams are signed and split into adaptive formats, so this
/// extractor only validates the URL and delegates to the generic fetcher.
#[derive(Debug, Default)]
pub struct YouTube;

impl YouTube {
    pub const NAME: &'static str = "youtube";

    pub fn video_id(url: &Url) -> Option<String> {
        let id = if host_matches(url, "youtu.be") {
            url.path_segments()?.next().map(str::to_string)
        } else if url.path() == "/watch" {
            url.query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned())
        } else {
            let mut segments = url.path_segments()?;
            match segments.next() {
                Some("shorts" | "embed" | "live" | "v") => segments.next().map(str::to_string),
                _ => None,
            }
        }?;
        VIDEO_ID.is_match(&id).then_some(id)
    }
}

#[async_trait]
impl PlatformExtractor for YouTube {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "youtube.com")
            || host_matches(url, "youtu.be")
            || host_matches(url, "youtube-nocookie.com")
    }

    async fn extract(&self, url: &Url) -> Result<Extraction, ExtractorError> {
        match Self::video_id(url) {
            Some(_) => Ok(Extraction::delegate("youtube requires signature handling")),
            None => Err(ExtractorError::InvalidUrl(url.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Option<String> {
        YouTube::video_id(&Url::parse(s).unwrap())
    }

    #[test]
    fn video_id_from_common_shapes() {
        assert_eq!(id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=4").as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(id("https://youtu.be/dQw4w9WgXcQ").as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(id("https://m.youtube.com/shorts/dQw4w9WgXcQ").as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(id("https://www.youtube.com/channel/UC123"), None);
        assert_eq!(id("https://www.youtube.com/watch?v=short"), None);
    }

    #[tokio::test]
    async fn always_delegates_valid_urls() {
        let url = Url::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        let extraction = YouTube.extract(&url).await.unwrap();
        assert!(matches!(extraction, Extraction::Delegate { .. }));

        let bad = Url::parse("https://www.youtube.com/feed/trending").unwrap();
        let err = YouTube.extract(&bad).await.unwrap_err();
        assert!(!err.kind().is_retryable());
    }
}
