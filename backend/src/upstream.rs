//! Outbound HTTP shared by every resolver strategy and the audio proxy.

use std::time::Duration;

use rand::seq::IndexedRandom;
use reqwest::{
    Method,
    header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderName, HeaderValue, ORIGIN, REFERER, USER_AGENT},
};
use serde_json::Value;
use tracing::debug;

use crate::error::UpstreamError;

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
];

const MAX_REDIRECTS: usize = 5;

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

#[derive(Debug, Clone)]
pub enum UpstreamBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// One outbound call: target, method, body, timeout and the site it should
/// appear to come from.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub body: UpstreamBody,
    pub timeout: Duration,
    pub accept: &'static str,
    pub origin: Option<String>,
    pub referer: Option<String>,
    pub extra_headers: Vec<(HeaderName, HeaderValue)>,
}

impl UpstreamRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            body: UpstreamBody::Empty,
            timeout,
            accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            origin: None,
            referer: None,
            extra_headers: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, body: UpstreamBody, timeout: Duration) -> Self {
        Self {
            method: Method::POST,
            body,
            accept: "application/json, text/plain, */*",
            ..Self::get(url, timeout)
        }
    }

    pub fn accept(mut self, accept: &'static str) -> Self {
        self.accept = accept;
        self
    }

    /// Sets `Origin` and a matching `Referer` (`<site>/`).
    pub fn from_site(mut self, site: &str) -> Self {
        let site = site.trim_end_matches('/');
        self.origin = Some(site.to_string());
        self.referer = Some(format!("{site}/"));
        self
    }

    pub fn referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn header(mut self, name: HeaderName, value: &'static str) -> Self {
        self.extra_headers
            .push((name, HeaderValue::from_static(value)));
        self
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|error| UpstreamError::InvalidResponse(error.to_string()))?;

        Ok(Self { http })
    }

    /// Sends the request and returns the response once its status is known.
    /// Non-2xx statuses are turned into [`UpstreamError::Status`].
    pub async fn send(&self, request: UpstreamRequest) -> Result<reqwest::Response, UpstreamError> {
        let url = url::Url::parse(&request.url)
            .map_err(|error| UpstreamError::InvalidUrl(format!("{}: {error}", request.url)))?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
        headers.insert(ACCEPT, HeaderValue::from_static(request.accept));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        if let Some(origin) = request.origin.as_deref()
            && let Ok(value) = HeaderValue::from_str(origin)
        {
            headers.insert(ORIGIN, value);
        }
        if let Some(referer) = request.referer.as_deref()
            && let Ok(value) = HeaderValue::from_str(referer)
        {
            headers.insert(REFERER, value);
        }
        for (name, value) in request.extra_headers {
            headers.insert(name, value);
        }

        debug!(method = %request.method, url = %url, "peticion saliente");

        let builder = self
            .http
            .request(request.method, url)
            .headers(headers);
        let builder = match request.body {
            UpstreamBody::Empty => builder,
            UpstreamBody::Json(value) => builder.json(&value),
            UpstreamBody::Form(fields) => builder.form(&fields),
        };

        let response = tokio::time::timeout(request.timeout, builder.send())
            .await
            .map_err(|_| UpstreamError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status));
        }

        Ok(response)
    }

    /// [`Self::send`] and read the whole body as text, still within the timeout.
    pub async fn fetch_text(&self, request: UpstreamRequest) -> Result<String, UpstreamError> {
        let timeout = request.timeout;
        let response = self.send(request).await?;

        tokio::time::timeout(timeout, response.text())
            .await
            .map_err(|_| UpstreamError::Timeout)?
            .map_err(UpstreamError::from)
    }
}
