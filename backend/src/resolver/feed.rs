use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{AudioStrategy, ResolvedAudio};
use crate::{
    error::UpstreamError,
    tiktok::TikTokTarget,
    upstream::{UpstreamClient, UpstreamRequest},
};

const FEED_API_BASE: &str = "https://api16-normal-c-useast1a.tiktokv.com";

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    aweme_list: Vec<FeedItem>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    desc: Option<String>,
    music: Option<FeedMusic>,
}

#[derive(Debug, Deserialize)]
struct FeedMusic {
    title: Option<String>,
    author: Option<String>,
    play_url: Option<FeedUrl>,
}

#[derive(Debug, Deserialize)]
struct FeedUrl {
    #[serde(default)]
    url_list: Vec<String>,
    uri: Option<String>,
}

/// Looks the video up by numeric id on TikTok's feed API and reads the
/// attached music track.
pub struct FeedApiStrategy {
    client: UpstreamClient,
    base: String,
}

impl FeedApiStrategy {
    pub fn new(client: UpstreamClient) -> Self {
        Self {
            client,
            base: FEED_API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    pub fn at(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }
}

#[async_trait]
impl AudioStrategy for FeedApiStrategy {
    fn name(&self) -> &'static str {
        "tiktok-feed"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(8)
    }

    async fn attempt(&self, target: &TikTokTarget) -> Result<Option<ResolvedAudio>, UpstreamError> {
        let Some(video_id) = target.numeric_video_id() else {
            debug!("sin id numerico, se omite la API de feed");
            return Ok(None);
        };

        let body = self
            .client
            .fetch_text(
                UpstreamRequest::get(
                    format!("{}/aweme/v1/feed/?aweme_id={video_id}", self.base),
                    self.timeout(),
                )
                .accept("application/json, text/plain, */*"),
            )
            .await?;

        if body.trim().is_empty() {
            return Ok(None);
        }

        let feed: FeedResponse = serde_json::from_str(&body)
            .map_err(|error| UpstreamError::InvalidResponse(format!("feed JSON: {error}")))?;

        Ok(audio_from_feed(feed))
    }
}

fn audio_from_feed(feed: FeedResponse) -> Option<ResolvedAudio> {
    let item = feed.aweme_list.into_iter().next()?;
    let music = item.music?;
    let play_url = music.play_url?;

    let audio_url = play_url
        .url_list
        .into_iter()
        .find(|url| !url.trim().is_empty())
        .or(play_url.uri.filter(|uri| !uri.trim().is_empty()))?;

    let title = music.title.or(item.desc);
    Some(ResolvedAudio::new(audio_url).with_metadata(title, music.author))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn parse(value: serde_json::Value) -> Option<ResolvedAudio> {
        audio_from_feed(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn prefers_first_url_list_entry() {
        let audio = parse(json!({
            "aweme_list": [{
                "desc": "video description",
                "music": {
                    "title": "original sound",
                    "author": "someone",
                    "play_url": {
                        "uri": "https://fallback.tiktokcdn.com/a.mp3",
                        "url_list": ["https://sf16-ies-music.tiktokcdn.com/obj/a.mp3", "https://other/b.mp3"]
                    }
                }
            }]
        }))
        .unwrap();

        assert_eq!(audio.audio_url, "https://sf16-ies-music.tiktokcdn.com/obj/a.mp3");
        assert_eq!(audio.title.as_deref(), Some("original sound"));
        assert_eq!(audio.author.as_deref(), Some("someone"));
    }

    #[test]
    fn falls_back_to_uri_and_description() {
        let audio = parse(json!({
            "aweme_list": [{
                "desc": "dance clip",
                "music": { "play_url": { "uri": "https://sf16.tiktokcdn.com/obj/a.mp3", "url_list": [] } }
            }]
        }))
        .unwrap();

        assert_eq!(audio.audio_url, "https://sf16.tiktokcdn.com/obj/a.mp3");
        assert_eq!(audio.title.as_deref(), Some("dance clip"));
        assert_eq!(audio.author, None);
    }

    #[test]
    fn empty_feed_yields_nothing() {
        assert_eq!(parse(json!({ "aweme_list": [] })), None);
        assert_eq!(parse(json!({ "status_code": 0 })), None);
        assert_eq!(parse(json!({ "aweme_list": [{ "desc": "no music" }] })), None);
    }

    #[tokio::test]
    async fn queries_feed_by_video_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/aweme/v1/feed/"))
            .and(query_param("aweme_id", "7156033831819734314"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "aweme_list": [{ "music": { "play_url": { "url_list": ["https://sf16.tiktokcdn.com/m.mp3"] } } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let strategy = FeedApiStrategy::new(UpstreamClient::new().unwrap()).at(server.uri());
        let target = TikTokTarget::new("https://www.tiktok.com/@tiktok/video/7156033831819734314");
        let found = strategy.attempt(&target).await.unwrap().unwrap();

        assert_eq!(found.audio_url, "https://sf16.tiktokcdn.com/m.mp3");
    }

    #[tokio::test]
    async fn skips_without_numeric_id() {
        let strategy = FeedApiStrategy::new(UpstreamClient::new().unwrap()).at("http://127.0.0.1:9");
        let target = TikTokTarget::new("https://vt.tiktok.com/ZSY5XrKqJ/");
        assert_eq!(strategy.attempt(&target).await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>blocked</html>"))
            .mount(&server)
            .await;

        let strategy = FeedApiStrategy::new(UpstreamClient::new().unwrap()).at(server.uri());
        let target = TikTokTarget::new("https://www.tiktok.com/@tiktok/video/7156033831819734314");
        let error = strategy.attempt(&target).await.unwrap_err();

        assert!(matches!(error, UpstreamError::InvalidResponse(_)));
    }
}
