//! Re-serves a resolved audio URL to the browser as a file download without
//! buffering it.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{
            ACCEPT_ENCODING, ACCEPT_RANGES, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH,
            CONTENT_TYPE, EXPIRES, PRAGMA, RANGE, X_CONTENT_TYPE_OPTIONS,
        },
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ApiError, Phase},
    upstream::{UpstreamClient, UpstreamRequest},
};

pub const DEFAULT_FILENAME: &str = "tiktok_audio.mp3";
pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";
const MAX_FILENAME_STEM: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTypePolicy {
    AlwaysMpeg,
    /// Use what the upstream reported, `audio/mpeg` when it reported nothing.
    Upstream,
}

/// Per-route knobs for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyProfile {
    pub timeout: Duration,
    pub content_type: ContentTypePolicy,
    pub accept: &'static str,
    pub nosniff: bool,
}

impl ProxyProfile {
    /// `/api/proxy-audio`
    pub fn proxy_audio() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            content_type: ContentTypePolicy::AlwaysMpeg,
            accept: "*/*",
            nosniff: true,
        }
    }

    /// `/api/download-audio`
    pub fn download_audio() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            content_type: ContentTypePolicy::Upstream,
            accept: "audio/webm,audio/ogg,audio/wav,audio/*;q=0.9,application/ogg;q=0.7,video/*;q=0.6,*/*;q=0.5",
            nosniff: false,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Keeps `[A-Za-z0-9._-]`, replaces everything else with `_` and makes sure
/// the name ends in `.mp3`.
pub fn sanitize_filename(input: Option<&str>) -> String {
    let Some(raw) = input.map(str::trim).filter(|value| !value.is_empty()) else {
        return DEFAULT_FILENAME.to_string();
    };

    let mut sanitized: String = raw
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect();

    if !sanitized.to_ascii_lowercase().ends_with(".mp3") || sanitized.len() > MAX_FILENAME_STEM + 4 {
        sanitized.truncate(MAX_FILENAME_STEM);
        sanitized.push_str(".mp3");
    }

    sanitized
}

pub fn validate_audio_url(raw: Option<&str>) -> Result<Url, ApiError> {
    let raw = raw
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL de audio no encontrada."))?;

    let parsed = Url::parse(raw).map_err(|error| {
        ApiError::bad_request("La URL de audio no es valida.").with_detail(error.to_string())
    })?;

    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ApiError::bad_request("La URL de audio no es valida."));
    }

    Ok(parsed)
}

pub fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{filename}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

/// Opens the upstream stream and, once its status is known to be good,
/// commits to a download response whose body is the upstream body.
///
/// Anything that goes wrong before that point becomes a normal JSON error.
/// Afterwards the status line is gone, so failures abort the connection.
pub async fn stream_audio(
    client: &UpstreamClient,
    audio_url: &Url,
    filename: &str,
    profile: &ProxyProfile,
    max_bytes: u64,
) -> Result<Response, ApiError> {
    let request = UpstreamRequest::get(audio_url.as_str(), profile.timeout)
        .accept(profile.accept)
        .from_site("https://www.tiktok.com")
        .header(RANGE, "bytes=0-")
        .header(ACCEPT_ENCODING, "identity");

    let upstream = client.send(request).await.map_err(|error| {
        warn!(%error, host = audio_url.host_str().unwrap_or_default(), "no se pudo abrir el audio");
        ApiError::from_upstream(&error, Phase::Proxy)
    })?;

    let content_length = upstream.content_length();
    if let Some(length) = content_length
        && length > max_bytes
    {
        let max_mb = max_bytes / 1_048_576;
        return Err(ApiError::payload_too_large(format!(
            "El audio supera el limite permitido de {max_mb} MB."
        )));
    }

    let content_type = match profile.content_type {
        ContentTypePolicy::AlwaysMpeg => HeaderValue::from_static("audio/mpeg"),
        ContentTypePolicy::Upstream => upstream
            .headers()
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("audio/mpeg")),
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename))
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(filename)
            .map_err(|_| ApiError::internal("No se pudo crear el nombre del archivo."))?,
    );
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, proxy-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if profile.nosniff {
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    }
    if let Some(length) = content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    info!(
        host = audio_url.host_str().unwrap_or_default(),
        filename,
        bytes = ?content_length,
        "transmitiendo audio"
    );

    let body = Body::from_stream(CappedStream::new(
        upstream.bytes_stream().map_err(io::Error::other),
        max_bytes,
        profile.timeout,
    ));
    Ok((StatusCode::OK, headers, body).into_response())
}

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Pass-through over the upstream body that enforces the size cap and an idle
/// deadline between chunks. Upstream failures, the cap and the deadline all
/// surface as I/O errors, which makes hyper drop the connection.
struct CappedStream {
    inner: ByteStream,
    transferred: u64,
    limit: u64,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
    done: bool,
}

impl CappedStream {
    fn new(
        inner: impl Stream<Item = io::Result<Bytes>> + Send + 'static,
        limit: u64,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            transferred: 0,
            limit,
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            done: false,
        }
    }
}

impl Stream for CappedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.transferred += chunk.len() as u64;
                if self.transferred > self.limit {
                    self.done = true;
                    warn!(limit = self.limit, "el audio supero el limite de tamano, se corta la transferencia");
                    return Poll::Ready(Some(Err(io::Error::other("limite de tamano excedido"))));
                }
                let deadline = Instant::now() + self.idle_timeout;
                self.idle.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                self.done = true;
                warn!(%error, transferred = self.transferred, "error leyendo el audio de origen");
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.done = true;
                debug!(transferred = self.transferred, "transferencia completa");
                Poll::Ready(None)
            }
            Poll::Pending => {
                if self.idle.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                self.done = true;
                warn!(
                    timeout = ?self.idle_timeout,
                    transferred = self.transferred,
                    "el origen dejo de enviar audio, se corta la transferencia"
                );
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "el origen dejo de enviar audio",
                ))))
            }
        }
    }
}

impl Drop for CappedStream {
    fn drop(&mut self) {
        if !self.done {
            info!(
                transferred = self.transferred,
                "el cliente cerro la conexion, se cancela la lectura del audio"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use futures_util::{StreamExt, stream};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn expect_error(result: Result<Response, ApiError>) -> ApiError {
        match result {
            Ok(response) => panic!("expected an error, got {}", response.status()),
            Err(error) => error,
        }
    }

    #[test]
    fn sanitizes_path_traversal() {
        let name = sanitize_filename(Some("../../etc/passwd"));
        assert_eq!(name, ".._.._etc_passwd.mp3");
        assert!(!name.contains('/'));
    }

    #[test]
    fn keeps_safe_names_and_fills_defaults() {
        assert_eq!(sanitize_filename(Some("tiktok_audio_1700.mp3")), "tiktok_audio_1700.mp3");
        assert_eq!(sanitize_filename(Some("my song")), "my_song.mp3");
        assert_eq!(sanitize_filename(Some("a\"b\r\nc.mp3")), "a_b__c.mp3");
        assert_eq!(sanitize_filename(None), DEFAULT_FILENAME);
        assert_eq!(sanitize_filename(Some("  ")), DEFAULT_FILENAME);
    }

    #[test]
    fn uppercase_extension_is_not_doubled() {
        assert_eq!(sanitize_filename(Some("song.MP3")), "song.MP3");
        assert_eq!(sanitize_filename(Some("Mix.Mp3")), "Mix.Mp3");
    }

    #[test]
    fn long_names_are_capped() {
        let name = sanitize_filename(Some(&"x".repeat(500)));
        assert_eq!(name.len(), MAX_FILENAME_STEM + 4);
        assert!(name.ends_with(".mp3"));
    }

    #[test]
    fn audio_url_must_be_absolute_http() {
        assert!(validate_audio_url(Some("https://cdn.example/a.mp3")).is_ok());
        assert_eq!(
            validate_audio_url(None).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
        assert!(validate_audio_url(Some("cdn.example/a.mp3")).is_err());
        assert!(validate_audio_url(Some("file:///etc/passwd")).is_err());
    }

    #[tokio::test]
    async fn forwards_bytes_with_download_headers() {
        let server = MockServer::start().await;
        let audio = vec![0x49u8, 0x44, 0x33, 0x04, 0x00, 0xff, 0xfb];
        Mock::given(method("GET"))
            .and(path("/a.mp3"))
            .and(header("range", "bytes=0-"))
            .and(header("referer", "https://www.tiktok.com/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/mp4")
                    .set_body_bytes(audio.clone()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/a.mp3", server.uri())).unwrap();
        let response = stream_audio(
            &UpstreamClient::new().unwrap(),
            &url,
            "clip.mp3",
            &ProxyProfile::download_audio(),
            1024,
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert!(
            headers[CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .starts_with("attachment; filename=\"clip.mp3\"")
        );
        assert_eq!(headers[CONTENT_TYPE], "audio/mp4");
        assert_eq!(headers[ACCEPT_RANGES], "bytes");
        assert_eq!(headers[CONTENT_LENGTH], "7");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), audio.as_slice());
    }

    #[tokio::test]
    async fn proxy_profile_forces_mpeg_and_nosniff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(vec![1u8, 2, 3]),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let response = stream_audio(
            &UpstreamClient::new().unwrap(),
            &url,
            DEFAULT_FILENAME,
            &ProxyProfile::proxy_audio(),
            1024,
        )
        .await
        .unwrap();

        assert_eq!(response.headers()[CONTENT_TYPE], "audio/mpeg");
        assert_eq!(response.headers()[X_CONTENT_TYPE_OPTIONS], "nosniff");
    }

    #[tokio::test]
    async fn timeout_before_headers_is_408() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let error = expect_error(
            stream_audio(
                &UpstreamClient::new().unwrap(),
                &url,
                DEFAULT_FILENAME,
                &ProxyProfile::proxy_audio().with_timeout(Duration::from_millis(100)),
                1024,
            )
            .await,
        );

        assert_eq!(error.status, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn upstream_status_is_propagated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let error = expect_error(
            stream_audio(
                &UpstreamClient::new().unwrap(),
                &url,
                DEFAULT_FILENAME,
                &ProxyProfile::proxy_audio(),
                1024,
            )
            .await,
        );

        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn declared_oversize_is_rejected_before_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let error = expect_error(
            stream_audio(
                &UpstreamClient::new().unwrap(),
                &url,
                DEFAULT_FILENAME,
                &ProxyProfile::proxy_audio(),
                16,
            )
            .await,
        );

        assert_eq!(error.status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn capped_stream_errors_once_limit_is_crossed() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abcd")),
            Ok(Bytes::from_static(b"efgh")),
            Ok(Bytes::from_static(b"ijkl")),
        ];
        let mut capped = CappedStream::new(stream::iter(chunks), 6, Duration::from_secs(5));

        assert_eq!(capped.next().await.unwrap().unwrap(), Bytes::from_static(b"abcd"));
        assert!(capped.next().await.unwrap().is_err());
        assert!(capped.next().await.is_none());
    }

    #[tokio::test]
    async fn capped_stream_ends_after_upstream_error() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abcd")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"never")),
        ];
        let mut capped = CappedStream::new(stream::iter(chunks), 1024, Duration::from_secs(5));

        assert_eq!(capped.next().await.unwrap().unwrap(), Bytes::from_static(b"abcd"));
        let error = capped.next().await.unwrap().unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);
        assert!(capped.next().await.is_none());
    }

    #[tokio::test]
    async fn capped_stream_gives_up_on_idle_upstream() {
        let first: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"abc"))];
        let mut capped = CappedStream::new(
            stream::iter(first).chain(stream::pending()),
            1024,
            Duration::from_millis(100),
        );

        assert_eq!(capped.next().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        let error = tokio::time::timeout(Duration::from_secs(5), capped.next())
            .await
            .expect("idle deadline should fire")
            .unwrap()
            .unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        assert!(capped.next().await.is_none());
    }

    /// Upstream that promises 100 bytes, sends 3, then either hangs or hangs up.
    async fn short_body_upstream(hang: bool) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: audio/mpeg\r\nContent-Length: 100\r\n\r\nabc",
                )
                .await
                .unwrap();
            socket.flush().await.unwrap();
            if hang {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            drop(socket);
        });
        Url::parse(&format!("http://{addr}/audio.mp3")).unwrap()
    }

    #[tokio::test]
    async fn stalled_body_is_aborted() {
        let url = short_body_upstream(true).await;
        let response = stream_audio(
            &UpstreamClient::new().unwrap(),
            &url,
            DEFAULT_FILENAME,
            &ProxyProfile::proxy_audio().with_timeout(Duration::from_millis(300)),
            1024,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = tokio::time::timeout(
            Duration::from_secs(5),
            to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("body should be cut off by the idle deadline");
        assert!(body.is_err());
    }

    #[tokio::test]
    async fn upstream_hang_up_mid_body_is_an_error() {
        let url = short_body_upstream(false).await;
        let response = stream_audio(
            &UpstreamClient::new().unwrap(),
            &url,
            DEFAULT_FILENAME,
            &ProxyProfile::proxy_audio(),
            1024,
        )
        .await
        .unwrap();

        let body = tokio::time::timeout(
            Duration::from_secs(5),
            to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .unwrap();
        assert!(body.is_err());
    }
}
