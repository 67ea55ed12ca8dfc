use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{
        HeaderName, Method, StatusCode,
        header::{ALLOW, CONTENT_DISPOSITION},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    config::{AppConfig, non_empty},
    error::{ApiError, Phase},
    proxy::{self, DOWNLOAD_FILENAME_HEADER, ProxyProfile},
    resolver::Resolver,
    tiktok::{TikTokTarget, is_valid_tiktok_url},
    upstream::UpstreamClient,
};

pub const PROXY_AUDIO_PATH: &str = "/api/proxy-audio";
pub const DOWNLOAD_AUDIO_PATH: &str = "/api/download-audio";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub client: UpstreamClient,
    pub resolver: Arc<Resolver>,
    pub simple_resolver: Arc<Resolver>,
    pub proxy_profile: ProxyProfile,
    pub download_profile: ProxyProfile,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, client: UpstreamClient) -> Self {
        let resolver = Resolver::standard(&client, config.strategy_order.as_deref());
        let simple_resolver = Resolver::url_only(&client);
        Self::with_resolvers(config, client, resolver, simple_resolver)
    }

    pub fn with_resolvers(
        config: AppConfig,
        client: UpstreamClient,
        resolver: Resolver,
        simple_resolver: Resolver,
    ) -> Self {
        Self {
            config: Arc::new(config),
            client,
            resolver: Arc::new(resolver),
            simple_resolver: Arc::new(simple_resolver),
            proxy_profile: ProxyProfile::proxy_audio(),
            download_profile: ProxyProfile::download_audio(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    success: bool,
    message: String,
    audio_url: String,
    download_url: String,
    filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    source: &'static str,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct AudioQuery {
    url: Option<String>,
    filename: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    let static_dir = state.config.static_dir.clone();

    Router::new()
        .route(
            "/api/download",
            post(download).options(preflight).fallback(only_post),
        )
        .route(
            "/api/download-simple",
            post(download_simple).options(preflight).fallback(only_post),
        )
        .route(
            PROXY_AUDIO_PATH,
            get(proxy_audio).options(preflight).fallback(only_get),
        )
        .route(
            DOWNLOAD_AUDIO_PATH,
            get(download_audio).options(preflight).fallback(only_get),
        )
        .route(
            "/api/status",
            get(status).options(preflight).fallback(only_get),
        )
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ])
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn only_post() -> impl IntoResponse {
    (
        [(ALLOW, "POST, OPTIONS")],
        ApiError::method_not_allowed("Metodo no permitido. Usa POST."),
    )
}

async fn only_get() -> impl IntoResponse {
    (
        [(ALLOW, "GET, HEAD, OPTIONS")],
        ApiError::method_not_allowed("Metodo no permitido. Usa GET."),
    )
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let now = Utc::now();
    Json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "strategies": state.resolver.strategy_names(),
        "uptimeSeconds": (now - state.started_at).num_seconds(),
        "timestamp": now.to_rfc3339(),
    }))
}

async fn download(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let expose = state.config.expose_error_details;
    async {
        let url = requested_url(payload)?;
        resolve_and_respond(&state.resolver, &TikTokTarget::new(&url), PROXY_AUDIO_PATH).await
    }
    .await
    .map_err(|error| error.expose(expose))
}

async fn download_simple(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let expose = state.config.expose_error_details;
    async {
        let url = requested_url(payload)?;
        resolve_and_respond(
            &state.simple_resolver,
            &TikTokTarget::url_only(&url),
            DOWNLOAD_AUDIO_PATH,
        )
        .await
    }
    .await
    .map_err(|error| error.expose(expose))
}

async fn proxy_audio(
    State(state): State<AppState>,
    query: Result<Query<AudioQuery>, QueryRejection>,
) -> Response {
    serve_audio(&state, query, &state.proxy_profile).await
}

async fn download_audio(
    State(state): State<AppState>,
    query: Result<Query<AudioQuery>, QueryRejection>,
) -> Response {
    serve_audio(&state, query, &state.download_profile).await
}

fn requested_url(payload: Result<Json<Value>, JsonRejection>) -> Result<String, ApiError> {
    let Json(body) = payload.map_err(|rejection| {
        ApiError::bad_request("Formato JSON invalido en el cuerpo de la solicitud.")
            .with_detail(rejection.body_text())
    })?;

    let url = body
        .get("url")
        .and_then(Value::as_str)
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("La URL de TikTok es obligatoria y debe ser texto."))?;

    if !is_valid_tiktok_url(url) {
        return Err(ApiError::bad_request(
            "URL no valida. Ingresa un enlace de TikTok correcto.",
        ));
    }

    Ok(url.to_string())
}

async fn resolve_and_respond(
    resolver: &Resolver,
    target: &TikTokTarget,
    stream_path: &str,
) -> Result<Json<DownloadResponse>, ApiError> {
    let resolution = resolver.resolve(target).await;

    let Some(audio) = resolution.audio else {
        if let Some(error) = resolution.sole_upstream_error() {
            return Err(ApiError::from_upstream(&error, Phase::Resolve));
        }
        return Err(ApiError::not_found(
            "No se pudo obtener el audio. El video puede haber sido eliminado o no estar disponible.",
        ));
    };

    let source = resolution.source.unwrap_or("desconocido");
    let timestamp = Utc::now().timestamp_millis();
    let filename = format!("tiktok_audio_{timestamp}.mp3");
    let download_url = format!(
        "{stream_path}?url={}&filename={}",
        urlencoding::encode(&audio.audio_url),
        urlencoding::encode(&filename)
    );

    info!(
        request_id = %resolution.request_id,
        source,
        attempts = resolution.attempts.len(),
        "audio resuelto"
    );

    Ok(Json(DownloadResponse {
        success: true,
        message: "Audio obtenido correctamente.".to_string(),
        audio_url: audio.audio_url,
        download_url,
        filename,
        title: audio.title,
        author: audio.author,
        source,
        timestamp,
    }))
}

async fn serve_audio(
    state: &AppState,
    query: Result<Query<AudioQuery>, QueryRejection>,
    profile: &ProxyProfile,
) -> Response {
    let expose = state.config.expose_error_details;
    let result = async {
        let Query(query) = query.map_err(|rejection| {
            ApiError::bad_request("Parametros de consulta invalidos.")
                .with_detail(rejection.body_text())
        })?;
        let audio_url = proxy::validate_audio_url(query.url.as_deref())?;
        let filename = proxy::sanitize_filename(query.filename.as_deref());

        proxy::stream_audio(
            &state.client,
            &audio_url,
            &filename,
            profile,
            state.config.max_audio_bytes,
        )
        .await
    }
    .await;

    match result {
        Ok(response) => response,
        Err(error) => {
            warn!(status = %error.status, message = %error.message, "descarga de audio rechazada");
            error.expose(expose).into_response()
        }
    }
}
