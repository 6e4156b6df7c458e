use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::extractor::error::ExtractorError;
use crate::extractor::platform_extractor::{Extraction, HttpExtractor, PlatformExtractor};
use crate::extractor::utils::{capture_group_1_or_invalid_url, json_u64};

pub static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.)?archive\.org/(?:details|embed)/([^/?#]+)").unwrap()
});

const VIDEO_FORMATS: &[&str] = &["h.264", "mpeg4", "h.264 hd", "512kb mpeg4"];

pub struct ArchiveOrg {
    http: HttpExtractor,
    base: String,
}

impl ArchiveOrg {
    pub const NAME: &'static str = "archive.org";
    const BASE: &'static str = "https://archive.org";

    pub fn new(client: Client) -> Self {
        Self {
            http: HttpExtractor::new(Self::NAME, client),
            base: Self::BASE.to_string(),
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    pub fn identifier(url: &str) -> Result<&str, ExtractorError> {
        capture_group_1_or_invalid_url(&URL_REGEX, url)
    }

    /// Choose the largest MP4 derivative listed in an item's metadata.
    fn parse_metadata(base: &str, identifier: &str, doc: &Value) -> Result<Extraction, ExtractorError> {
        let Some(obj) = doc.as_object() else {
            return Err(ExtractorError::structure("metadata is not an object"));
        };
        // Unknown identifiers come back as an empty object.
        if obj.is_empty() {
            return Err(ExtractorError::NotFound(identifier.to_string()));
        }
        if obj.get("is_dark").and_then(Value::as_bool) == Some(true) {
            return Err(ExtractorError::Private(format!(
                "{identifier} has been withdrawn from public access"
            )));
        }

        let files = obj
            .get("files")
            .and_then(Value::as_array)
            .ok_or_else(|| ExtractorError::structure("metadata without files"))?;

        let best = files
            .iter()
            .filter(|f| {
                let name = f.get("name").and_then(Value::as_str).unwrap_or_default();
                let format = f
                    .get("format")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                name.to_ascii_lowercase().ends_with(".mp4")
                    || VIDEO_FORMATS.contains(&format.as_str())
            })
            .max_by_key(|f| json_u64(f.get("size")).unwrap_or(0))
            .ok_or_else(|| ExtractorError::NotFound(format!("{identifier} has no video files")))?;

        let name = best
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ExtractorError::structure("file entry without name"))?;

        let mut url = Url::parse(base)
            .map_err(|e| ExtractorError::InvalidUrl(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ExtractorError::InvalidUrl(base.to_string()))?
            .extend(["download", identifier])
            .extend(name.split('/'));

        Ok(Extraction::Direct {
            url: url.to_string(),
            content_length: json_u64(best.get("size")),
            height: json_u64(best.get("height")).and_then(|h| u32::try_from(h).ok()),
        })
    }
}

#[async_trait]
impl PlatformExtractor for ArchiveOrg {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn matches(&self, url: &Url) -> bool {
        URL_REGEX.is_match(url.as_str())
    }

    async fn extract(&self, url: &Url) -> Result<Extraction, ExtractorError> {
        let identifier = Self::identifier(url.as_str())?;
        let doc: Value = self
            .http
            .get_json(&format!("{}/metadata/{identifier}", self.base))
            .await?;
        Self::parse_metadata(&self.base, identifier, &doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn largest_mp4_wins_and_name_is_encoded() {
        let doc = json!({
            "metadata": {"identifier": "night_of_the_living_dead"},
            "files": [
                {"name": "cover.jpg", "format": "JPEG", "size": "100"},
                {"name": "movie 512kb.mp4", "format": "512Kb MPEG4", "size": "200000"},
                {"name": "movie.mp4", "format": "h.264", "size": "900000"}
            ]
        });
        let extraction =
            ArchiveOrg::parse_metadata("https://archive.org", "night_of_the_living_dead", &doc)
                .unwrap();
        assert_eq!(
            extraction,
            Extraction::Direct {
                url: "https://archive.org/download/night_of_the_living_dead/movie.mp4".into(),
                content_length: Some(900_000),
                height: None,
            }
        );
    }

    #[test]
    fn empty_document_is_not_found() {
        let err = ArchiveOrg::parse_metadata("https://archive.org", "nope", &json!({})).unwrap_err();
        assert!(matches!(err, ExtractorError::NotFound(_)));
    }

    #[test]
    fn dark_item_is_private() {
        let err = ArchiveOrg::parse_metadata("https://archive.org", "x", &json!({"is_dark": true}))
            .unwrap_err();
        assert!(matches!(err, ExtractorError::Private(_)));
    }

    #[test]
    fn identifier_from_details_url() {
        assert_eq!(
            ArchiveOrg::identifier("https://archive.org/details/Popeye_forPresident").unwrap(),
            "Popeye_forPresident"
        );
    }
}
