use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{
    AudioStrategy, ResolvedAudio, compile_patterns, first_media_match, is_plausible_media_url,
    unescape_url,
};
use crate::{
    error::UpstreamError,
    tiktok::TikTokTarget,
    upstream::{UpstreamClient, UpstreamRequest},
};

static JSON_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<script[^>]+type="application/(?:ld\+)?json"[^>]*>(.*?)</script>"#)
        .expect("json script pattern")
});

/// Raw-HTML fallbacks, music track first, then anything that looks like media.
static PAGE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_patterns(&[
        r#""music":\{[^{}]*?"playUrl":"([^"]+)""#,
        r#"https?:(?:\\/|\\u002F|/)(?:\\/|\\u002F|/)[^"'\s<>]+?\.mp3[^"'\s<>]*"#,
        r#""playAddr":"([^"]+)""#,
        r#""downloadAddr":"([^"]+)""#,
    ])
});

/// Hosts whose pages may be fetched, matched exactly or as a parent domain.
const PAGE_HOSTS: [&str; 1] = ["tiktok.com"];

/// Fetches the video page itself and digs the audio out of its markup.
pub struct PageScrapeStrategy {
    client: UpstreamClient,
    hosts: Vec<String>,
}

impl PageScrapeStrategy {
    pub fn new(client: UpstreamClient) -> Self {
        Self {
            client,
            hosts: PAGE_HOSTS.iter().map(ToString::to_string).collect(),
        }
    }

    #[cfg(test)]
    pub fn trusting(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    /// The submitted link is only fetched when it points at a TikTok host.
    fn accepts(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };

        matches!(parsed.scheme(), "http" | "https")
            && self.hosts.iter().any(|allowed| {
                host == allowed.as_str()
                    || host
                        .strip_suffix(allowed.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            })
    }
}

#[async_trait]
impl AudioStrategy for PageScrapeStrategy {
    fn name(&self) -> &'static str {
        "tiktok-page"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn attempt(&self, target: &TikTokTarget) -> Result<Option<ResolvedAudio>, UpstreamError> {
        if !self.accepts(&target.url) {
            debug!(url = %target.url, "host ajeno a TikTok, no se descarga la pagina");
            return Ok(None);
        }

        let html = self
            .client
            .fetch_text(
                UpstreamRequest::get(target.url.clone(), self.timeout())
                    .referer("https://www.tiktok.com/"),
            )
            .await?;

        Ok(extract_from_page(&html))
    }
}

/// Structured data first, then the regex battery over the raw page.
pub fn extract_from_page(html: &str) -> Option<ResolvedAudio> {
    let structured = JSON_SCRIPT
        .captures_iter(html)
        .filter_map(|captures| captures.get(1))
        .filter_map(|block| serde_json::from_str::<Value>(block.as_str().trim()).ok())
        .find_map(|document| find_audio_object(&document));
    if structured.is_some() {
        debug!("audio encontrado en datos estructurados");
        return structured;
    }

    first_media_match(html, &PAGE_PATTERNS).map(ResolvedAudio::new)
}

/// Depth-first search for `{"audio": {"contentUrl": ...}}`, taking title and
/// author from the object that owns the audio.
fn find_audio_object(value: &Value) -> Option<ResolvedAudio> {
    match value {
        Value::Object(map) => {
            let content_url = map
                .get("audio")
                .and_then(|audio| audio.get("contentUrl"))
                .and_then(Value::as_str)
                .map(unescape_url)
                .filter(|url| is_plausible_media_url(url) || url.starts_with("http"));

            if let Some(content_url) = content_url {
                let title = map
                    .get("name")
                    .or_else(|| map.get("description"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                let author = map
                    .get("author")
                    .or_else(|| map.get("creator"))
                    .and_then(|author| author.get("name").or(Some(author)))
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                return Some(ResolvedAudio::new(content_url).with_metadata(title, author));
            }

            map.values().find_map(find_audio_object)
        }
        Value::Array(items) => items.iter().find_map(find_audio_object),
        _ => None,
    }
}
