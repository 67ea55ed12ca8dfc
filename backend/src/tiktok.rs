//! Recognising TikTok links and pulling video identifiers out of them.

use std::sync::LazyLock;

use regex::Regex;

static ACCEPTED_URL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^(https?://)?(www\.|m\.)?tiktok\.com/@[\w.-]+/video/\d+",
        r"(?i)^(https?://)?(vt|vm)\.tiktok\.com/[\w-]+/?",
        r"(?i)^(https?://)?m\.tiktok\.com/v/\d+",
        r"(?i)^(https?://)?m\.tiktok\.com/t/[\w-]+/?",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("tiktok url pattern"))
    .collect()
});

static VIDEO_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"/video/(\d+)",
        r"/@[\w.]+/video/(\d+)",
        r"/(\d{19})(?:\D|$)",
        r"(?i)(?:vt|vm)\.tiktok\.com/([A-Za-z0-9]+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("video id pattern"))
    .collect()
});

/// Loose acceptance test. Anything mentioning `tiktok.com` passes; the
/// resolver chain is what actually decides whether the link is usable.
pub fn is_valid_tiktok_url(input: &str) -> bool {
    let input = input.trim();
    if input.is_empty() {
        return false;
    }

    ACCEPTED_URL_PATTERNS
        .iter()
        .any(|pattern| pattern.is_match(input))
        || input.to_ascii_lowercase().contains("tiktok.com")
}

/// First identifier matched by the ordered pattern list. Short links yield
/// their token rather than a numeric id.
pub fn extract_video_id(url: &str) -> Option<String> {
    VIDEO_ID_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(url))
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string())
}

/// Link as submitted plus whatever id could be derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TikTokTarget {
    pub url: String,
    pub video_id: Option<String>,
}

impl TikTokTarget {
    pub fn new(url: &str) -> Self {
        let url = url.trim();
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("https://{url}")
        };
        let video_id = extract_video_id(&url);

        Self { url, video_id }
    }

    /// Same link without id derivation, for URL-only resolver chains.
    pub fn url_only(url: &str) -> Self {
        Self {
            video_id: None,
            ..Self::new(url)
        }
    }

    pub fn numeric_video_id(&self) -> Option<&str> {
        self.video_id
            .as_deref()
            .filter(|id| !id.is_empty() && id.bytes().all(|byte| byte.is_ascii_digit()))
    }
}
