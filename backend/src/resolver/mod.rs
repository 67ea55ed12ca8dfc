//! Audio resolution: an ordered chain of [`AudioStrategy`] implementations,
//! tried one after another until one yields a direct audio URL.
//!
//! Each strategy talks to a different upstream (hosted downloaders, the TikTok
//! feed API, the video page itself). Upstreams come and go, so the chain is
//! plain data: build a [`Resolver`] from whichever strategies are wanted, in
//! the order they should run.

pub mod feed;
pub mod hosted;
pub mod page;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{Instrument, info, info_span, warn};
use url::Url;
use uuid::Uuid;

use crate::{error::UpstreamError, tiktok::TikTokTarget, upstream::UpstreamClient};

/// Substrings that mark a URL as served from a TikTok media host.
const MEDIA_HOST_HINTS: [&str; 5] = [
    "tiktokcdn",
    "tiktokv.com",
    "muscdn.com",
    "ibytedtos.com",
    "byteoversea.com",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAudio {
    pub audio_url: String,
    pub title: Option<String>,
    pub author: Option<String>,
}

impl ResolvedAudio {
    pub fn new(audio_url: impl Into<String>) -> Self {
        Self {
            audio_url: audio_url.into(),
            title: None,
            author: None,
        }
    }

    pub fn with_metadata(mut self, title: Option<String>, author: Option<String>) -> Self {
        self.title = title.and_then(|value| normalize_optional_text(&value));
        self.author = author.and_then(|value| normalize_optional_text(&value));
        self
    }
}

/// One way of turning a TikTok link into a direct audio URL.
///
/// `Ok(None)` means the upstream answered but had nothing usable; `Err` means
/// the attempt itself failed. The [`Resolver`] treats both as "try the next one"
/// but records them differently.
#[async_trait]
pub trait AudioStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upper bound for the whole attempt, enforced by the resolver.
    fn timeout(&self) -> Duration;

    async fn attempt(&self, target: &TikTokTarget) -> Result<Option<ResolvedAudio>, UpstreamError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Found,
    Empty,
    /// The strategy produced a URL that could not be turned into an absolute http(s) URL.
    Rejected(String),
    Failed(UpstreamError),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub strategy: &'static str,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub request_id: Uuid,
    pub audio: Option<ResolvedAudio>,
    pub source: Option<&'static str>,
    pub attempts: Vec<Attempt>,
}

impl Resolution {
    /// When the chain came down to a single failed call, its error is worth
    /// surfacing to the caller instead of a generic "not found".
    pub fn sole_upstream_error(&self) -> Option<UpstreamError> {
        match self.attempts.as_slice() {
            [only] => match &only.outcome {
                AttemptOutcome::Failed(error) => Some(error.clone()),
                AttemptOutcome::TimedOut => Some(UpstreamError::Timeout),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Resolver {
    strategies: Vec<Arc<dyn AudioStrategy>>,
}

impl Resolver {
    pub fn new(strategies: Vec<Arc<dyn AudioStrategy>>) -> Self {
        Self { strategies }
    }

    /// Full chain used by `/api/download`, optionally reordered or filtered by name.
    pub fn standard(client: &UpstreamClient, order: Option<&[String]>) -> Self {
        let catalogue = catalogue(client);
        let Some(order) = order else {
            return Self::new(catalogue);
        };

        let mut selected = Vec::new();
        for name in order {
            match catalogue.iter().find(|strategy| strategy.name() == name.as_str()) {
                Some(strategy) => selected.push(Arc::clone(strategy)),
                None => warn!(strategy = %name, "estrategia desconocida en RESOLVER_STRATEGIES, se ignora"),
            }
        }

        if selected.is_empty() {
            warn!("RESOLVER_STRATEGIES no contiene estrategias validas. Se usara el orden por defecto.");
            return Self::new(catalogue);
        }

        Self::new(selected)
    }

    /// Chain for the simple endpoint: only strategies that work from the raw link.
    pub fn url_only(client: &UpstreamClient) -> Self {
        Self::new(vec![
            Arc::new(hosted::HostedDownloader::ssstik(client.clone())),
            Arc::new(hosted::HostedDownloader::tikdown(client.clone())),
            Arc::new(hosted::TtDownloader::new(client.clone())),
            Arc::new(page::PageScrapeStrategy::new(client.clone())),
        ])
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    /// Tries every strategy in order, one at a time. The first usable URL wins.
    pub async fn resolve(&self, target: &TikTokTarget) -> Resolution {
        let request_id = Uuid::new_v4();
        let span = info_span!("resolve", %request_id, url = %target.url);

        async move {
            let mut attempts = Vec::with_capacity(self.strategies.len());

            for strategy in &self.strategies {
                let name = strategy.name();
                let outcome =
                    match tokio::time::timeout(strategy.timeout(), strategy.attempt(target)).await {
                        Err(_) => AttemptOutcome::TimedOut,
                        Ok(Err(error)) => AttemptOutcome::Failed(error),
                        Ok(Ok(None)) => AttemptOutcome::Empty,
                        Ok(Ok(Some(found))) => match normalize_audio_url(&found.audio_url) {
                            Some(audio_url) => {
                                info!(strategy = name, "audio encontrado");
                                attempts.push(Attempt {
                                    strategy: name,
                                    outcome: AttemptOutcome::Found,
                                });
                                return Resolution {
                                    request_id,
                                    audio: Some(ResolvedAudio { audio_url, ..found }),
                                    source: Some(name),
                                    attempts,
                                };
                            }
                            None => AttemptOutcome::Rejected(found.audio_url),
                        },
                    };

                match &outcome {
                    AttemptOutcome::Failed(error) => {
                        warn!(strategy = name, %error, "la estrategia fallo")
                    }
                    AttemptOutcome::TimedOut => {
                        warn!(strategy = name, timeout = ?strategy.timeout(), "la estrategia excedio el tiempo limite")
                    }
                    AttemptOutcome::Rejected(candidate) => {
                        warn!(strategy = name, candidate = %candidate, "URL de audio descartada")
                    }
                    _ => info!(strategy = name, "sin resultado"),
                }
                attempts.push(Attempt {
                    strategy: name,
                    outcome,
                });
            }

            warn!(attempted = attempts.len(), "ninguna estrategia encontro audio");
            Resolution {
                request_id,
                audio: None,
                source: None,
                attempts,
            }
        }
        .instrument(span)
        .await
    }
}

/// Every strategy the service knows, in the default priority order.
pub fn catalogue(client: &UpstreamClient) -> Vec<Arc<dyn AudioStrategy>> {
    vec![
        Arc::new(hosted::HostedDownloader::ttsave(client.clone())),
        Arc::new(feed::FeedApiStrategy::new(client.clone())),
        Arc::new(page::PageScrapeStrategy::new(client.clone())),
        Arc::new(hosted::HostedDownloader::tikdown(client.clone())),
        Arc::new(hosted::HostedDownloader::ssstik(client.clone())),
        Arc::new(hosted::TtDownloader::new(client.clone())),
    ]
}

/// Repairs a scheme-less candidate and accepts it only if it parses as an
/// absolute http(s) URL with a host.
pub fn normalize_audio_url(candidate: &str) -> Option<String> {
    let candidate = unescape_url(candidate.trim());
    if candidate.is_empty() {
        return None;
    }

    let repaired = if let Some(rest) = candidate.strip_prefix("//") {
        format!("https://{rest}")
    } else if candidate.starts_with("http://") || candidate.starts_with("https://") {
        candidate
    } else if candidate.contains("://") {
        return None;
    } else {
        format!("https://{candidate}")
    };

    let parsed = Url::parse(&repaired).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.host_str()?;

    Some(repaired)
}

/// Undoes the JSON/JS escaping commonly found around URLs embedded in pages.
pub fn unescape_url(value: &str) -> String {
    value
        .replace("\\u002F", "/")
        .replace("\\u002f", "/")
        .replace("\\u0026", "&")
        .replace("\\/", "/")
        .replace("&amp;", "&")
}

/// Whether a captured value looks like something we can stream as audio.
pub fn is_plausible_media_url(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    !lower.is_empty()
        && (lower.contains(".mp3") || MEDIA_HOST_HINTS.iter().any(|hint| lower.contains(hint)))
}

/// First capture, by pattern priority, that unescapes to a plausible media URL.
/// Patterns without a capture group contribute their whole match.
pub fn first_media_match(body: &str, patterns: &[Regex]) -> Option<String> {
    patterns.iter().find_map(|pattern| {
        pattern.captures_iter(body).find_map(|captures| {
            let raw = captures.get(1).or_else(|| captures.get(0))?.as_str();
            let candidate = unescape_url(raw);
            (is_plausible_media_url(&candidate) && normalize_audio_url(&candidate).is_some())
                .then_some(candidate)
        })
    })
}

pub fn compile_patterns(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).expect("media url pattern"))
        .collect()
}

fn normalize_optional_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
