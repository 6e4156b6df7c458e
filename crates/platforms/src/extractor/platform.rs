use url::Url;

use super::utils::host_matches;

/// Coarse source-platform detection, used for logging and for the
/// failure advisories attached to terminal errors.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum Platform {
    YouTube,
    Vimeo,
    Dailymotion,
    Streamable,
    ArchiveOrg,
    Twitter,
    Facebook,
    Instagram,
    TikTok,
    Twitch,
    Generic,
}

const HOSTS: &[(&str, Platform)] = &[
    ("youtube.com", Platform::YouTube),
    ("youtu.be", Platform::YouTube),
    ("youtube-nocookie.com", Platform::YouTube),
    ("vimeo.com", Platform::Vimeo),
    ("dailymotion.com", Platform::Dailymotion),
    ("dai.ly", Platform::Dailymotion),
    ("streamable.com", Platform::Streamable),
    ("archive.org", Platform::ArchiveOrg),
    ("twitter.com", Platform::Twitter),
    ("x.com", Platform::Twitter),
    ("facebook.com", Platform::Facebook),
    ("fb.watch", Platform::Facebook),
    ("instagram.com", Platform::Instagram),
    ("tiktok.com", Platform::TikTok),
    ("twitch.tv", Platform::Twitch),
];

impl Platform {
    pub fn detect(url: &Url) -> Self {
        HOSTS
            .iter()
            .find(|(domain, _)| host_matches(url, domain))
            .map(|(_, p)| *p)
            .unwrap_or(Platform::Generic)
    }

    pub fn detect_str(url: &str) -> Self {
        Url::parse(url)
            .map(|u| Self::detect(&u))
            .unwrap_or(Platform::Generic)
    }

    /// Human-readable name for user-facing messages.
    pub fn display_name(self) -> &'static str {
        match self {
            Platform::YouTube => "YouTube",
            Platform::Vimeo => "Vimeo",
            Platform::Dailymotion => "Dailymotion",
            Platform::Streamable => "Streamable",
            Platform::ArchiveOrg => "Internet Archive",
            Platform::Twitter => "X/Twitter",
            Platform::Facebook => "Facebook",
            Platform::Instagram => "Instagram",
            Platform::TikTok => "TikTok",
            Platform::Twitch => "Twitch",
            Platform::Generic => "the source site",
        }
    }

    /// Platforms that gate most content behind a login.
    pub fn requires_login_often(self) -> bool {
        matches!(self, Platform::Facebook | Platform::Instagram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_hosts() {
        assert_eq!(Platform::detect_str("https://youtu.be/abc"), Platform::YouTube);
        assert_eq!(Platform::detect_str("https://m.facebook.com/watch"), Platform::Facebook);
        assert_eq!(Platform::detect_str("https://x.com/a/status/1"), Platform::Twitter);
        assert_eq!(Platform::detect_str("https://box.com/x.mp4"), Platform::Generic);
        assert_eq!(Platform::detect_str("not a url"), Platform::Generic);
    }

    #[test]
    fn round_trips_through_strings() {
        assert_eq!(Platform::ArchiveOrg.to_string(), "archive_org");
        assert_eq!("vimeo".parse::<Platform>().unwrap(), Platform::Vimeo);
    }
}
