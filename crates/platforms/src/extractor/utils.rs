use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::extractor::error::ExtractorError;

#[inline]
pub fn capture_group_1<'a>(re: &Regex, input: &'a str) -> Option<&'a str> {
    re.captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[inline]
pub fn capture_group_1_or_invalid_url<'a>(
    re: &Regex,
    input: &'a str,
) -> Result<&'a str, ExtractorError> {
    capture_group_1(re, input).ok_or_else(|| ExtractorError::InvalidUrl(input.to_string()))
}

/// Read a number that platforms serialize either as JSON number or string.
pub fn json_u64(value: Option<&Value>) -> Option<u64> {
    value.and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    })
}

/// Platforms sometimes hand out protocol-relative CDN links.
pub fn absolutize(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        url.to_string()
    }
}

/// Parse a `Retry-After` header value given in delta-seconds.
///
/// HTTP-date values are not interpreted and yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// True when the host equals `domain` or is a subdomain of it.
pub fn host_matches(url: &url::Url, domain: &str) -> bool {
    url.host_str().is_some_and(|host| {
        host.eq_ignore_ascii_case(domain)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_numbers_in_both_encodings() {
        assert_eq!(json_u64(Some(&json!(42))), Some(42));
        assert_eq!(json_u64(Some(&json!("1337"))), Some(1337));
        assert_eq!(json_u64(Some(&json!("n/a"))), None);
        assert_eq!(json_u64(None), None);
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after(" 120 "), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn host_matching_includes_subdomains() {
        let url = url::Url::parse("https://player.vimeo.com/video/1").unwrap();
        assert!(host_matches(&url, "vimeo.com"));
        assert!(!host_matches(&url, "meo.com"));
    }

    #[test]
    fn protocol_relative_links_become_https() {
        assert_eq!(absolutize("//cdn.example/a.mp4"), "https://cdn.example/a.mp4");
        assert_eq!(absolutize("http://x/a.mp4"), "http://x/a.mp4");
    }
}
