//! Third-party "TikTok downloader" sites. They take the TikTok link in a form
//! or JSON POST and answer with HTML or JSON that mentions the audio file.

use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use super::{AudioStrategy, ResolvedAudio, compile_patterns, first_media_match, is_plausible_media_url, unescape_url};
use crate::{
    error::UpstreamError,
    tiktok::TikTokTarget,
    upstream::{UpstreamBody, UpstreamClient, UpstreamRequest},
};

/// Last resort for any downloader page: a bare `.mp3` link anywhere in the body.
const ANY_MP3: &str = r#"https?://[^\s"'<>]+\.mp3[^\s"'<>]*"#;

static CSRF_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"name="_token"\s+value="([^"]+)""#).expect("csrf token pattern")
});

/// JSON fields some downloaders use for the audio link, most specific first.
const JSON_AUDIO_POINTERS: [&str; 4] = ["/links/mp3", "/music", "/audioUrl", "/data/music"];
/// JSON fields carrying an HTML fragment worth scanning.
const JSON_HTML_POINTERS: [&str; 2] = ["/html", "/data"];

pub struct HostedDownloader {
    name: &'static str,
    client: UpstreamClient,
    site: String,
    path: &'static str,
    body: fn(&str) -> UpstreamBody,
    patterns: Vec<Regex>,
    timeout: Duration,
}

impl HostedDownloader {
    pub fn ttsave(client: UpstreamClient) -> Self {
        Self {
            name: "ttsave",
            client,
            site: "https://ttsave.app".to_string(),
            path: "/download",
            body: |url| UpstreamBody::Json(json!({ "query": url, "language_id": "2" })),
            patterns: compile_patterns(&[
                r#"href="(https://v16-ies-music\.tiktokcdn\.com/[^"]+)""#,
                r#"href="(https://sf[0-9]+[\w-]*\.tiktokcdn\.com/[^"]+\.mp3[^"]*)""#,
                r#""music":"([^"]+\.mp3)""#,
                r#"audioUrl":"([^"]+)""#,
                ANY_MP3,
            ]),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn ssstik(client: UpstreamClient) -> Self {
        Self {
            name: "ssstik",
            client,
            site: "https://ssstik.io".to_string(),
            path: "/abc",
            body: |url| {
                UpstreamBody::Form(vec![
                    ("id".to_string(), url.to_string()),
                    ("locale".to_string(), "en".to_string()),
                    ("tt".to_string(), "abc123".to_string()),
                ])
            },
            patterns: compile_patterns(&[
                r#"<a[^>]+href="(https?://[^"]+)"[^>]*>[^<]*(?i:mp3|music)"#,
                r#"href="(https?://[^"]+\.mp3[^"]*)""#,
                ANY_MP3,
            ]),
            timeout: Duration::from_secs(15),
        }
    }

    /// Secondary AJAX endpoint answering with an HTML fragment of download anchors.
    pub fn tikdown(client: UpstreamClient) -> Self {
        Self {
            name: "tikdown",
            client,
            site: "https://tikdown.org".to_string(),
            path: "/getAjax",
            body: |url| UpstreamBody::Form(vec![("url".to_string(), url.to_string())]),
            patterns: compile_patterns(&[
                r#"<a[^>]+href="([^"]+\.mp3)""#,
                r#"<a[^>]+href="([^"]+\.mp3[^"]*)""#,
            ]),
            timeout: Duration::from_secs(15),
        }
    }

    /// Points the strategy at another host, keeping the request path.
    #[cfg(test)]
    pub fn at(mut self, site: impl Into<String>) -> Self {
        self.site = site.into();
        self
    }

    fn extract(&self, body: &str) -> Option<String> {
        if let Ok(document) = serde_json::from_str::<Value>(body) {
            let direct = JSON_AUDIO_POINTERS
                .iter()
                .filter_map(|pointer| document.pointer(pointer).and_then(Value::as_str))
                .map(unescape_url)
                .find(|candidate| is_plausible_media_url(candidate));
            if direct.is_some() {
                return direct;
            }

            let fragment = JSON_HTML_POINTERS
                .iter()
                .filter_map(|pointer| document.pointer(pointer).and_then(Value::as_str))
                .find_map(|html| first_media_match(html, &self.patterns));
            if fragment.is_some() {
                return fragment;
            }
        }

        first_media_match(body, &self.patterns)
    }
}

#[async_trait]
impl AudioStrategy for HostedDownloader {
    fn name(&self) -> &'static str {
        self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, target: &TikTokTarget) -> Result<Option<ResolvedAudio>, UpstreamError> {
        let request = UpstreamRequest::post(
            format!("{}{}", self.site, self.path),
            (self.body)(&target.url),
            self.timeout,
        )
        .from_site(&self.site);

        let body = self.client.fetch_text(request).await?;
        debug!(strategy = self.name, bytes = body.len(), "respuesta recibida");

        Ok(self.extract(&body).map(ResolvedAudio::new))
    }
}

/// Downloader that wants a CSRF token from its landing page before it will
/// accept the form.
pub struct TtDownloader {
    client: UpstreamClient,
    site: String,
    timeout: Duration,
    patterns: Vec<Regex>,
}

impl TtDownloader {
    pub fn new(client: UpstreamClient) -> Self {
        Self {
            client,
            site: "https://ttdownloader.com".to_string(),
            timeout: Duration::from_secs(20),
            patterns: compile_patterns(&[r#"href="(https:[^"]+\.mp3[^"]*)""#, ANY_MP3]),
        }
    }

    #[cfg(test)]
    pub fn at(mut self, site: impl Into<String>) -> Self {
        self.site = site.into();
        self
    }
}

#[async_trait]
impl AudioStrategy for TtDownloader {
    fn name(&self) -> &'static str {
        "ttdownloader"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, target: &TikTokTarget) -> Result<Option<ResolvedAudio>, UpstreamError> {
        let landing = self
            .client
            .fetch_text(UpstreamRequest::get(format!("{}/", self.site), self.timeout))
            .await?;

        let Some(token) = CSRF_TOKEN
            .captures(&landing)
            .and_then(|captures| captures.get(1))
            .map(|found| found.as_str().to_string())
        else {
            debug!("ttdownloader no entrego token");
            return Ok(None);
        };

        let form = UpstreamBody::Form(vec![
            ("url".to_string(), target.url.clone()),
            ("format".to_string(), String::new()),
            ("_token".to_string(), token),
        ]);
        let result = self
            .client
            .fetch_text(
                UpstreamRequest::post(format!("{}/req/", self.site), form, self.timeout)
                    .from_site(&self.site),
            )
            .await?;

        Ok(first_media_match(&result, &self.patterns).map(ResolvedAudio::new))
    }
}
