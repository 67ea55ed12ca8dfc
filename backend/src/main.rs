mod config;
mod error;
mod proxy;
mod resolver;
mod routes;
mod tiktok;
mod upstream;

use std::path::PathBuf;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{config::AppConfig, error::ApiError, routes::AppState, upstream::UpstreamClient};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tiktok_audio_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let mut config = AppConfig::from_env();
    config.static_dir = locate_static_dir(config.static_dir);

    let client = UpstreamClient::new()
        .map_err(|error| ApiError::internal(format!("No se pudo crear cliente HTTP: {error}")))?;

    if config.expose_error_details {
        warn!("Detalles internos de errores visibles en las respuestas. Solo para desarrollo.");
    }

    let addr = config.bind_addr.clone();
    let state = AppState::new(config, client);
    info!(
        strategies = ?state.resolver.strategy_names(),
        simple = ?state.simple_resolver.strategy_names(),
        max_audio_bytes = state.config.max_audio_bytes,
        "cadena de resolucion configurada"
    );

    let app = routes::build_router(state);

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("No se pudo iniciar el puerto {addr}: {error}"))
    })?;

    info!("Backend listo en http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")))
}

/// Relative paths are tried against the working directory first, then
/// against the crate directory so `cargo run` from the workspace root works.
fn locate_static_dir(configured: PathBuf) -> PathBuf {
    if configured.is_absolute() || configured.is_dir() {
        return configured;
    }

    let bundled = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(&configured);
    if bundled.is_dir() {
        return bundled;
    }

    warn!(dir = %configured.display(), "carpeta de la interfaz no encontrada, solo se sirve la API");
    configured
}
