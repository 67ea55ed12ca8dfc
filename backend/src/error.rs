use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Failure classes of a single outbound call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("tiempo de espera agotado")]
    Timeout,
    #[error("no se pudo conectar: {0}")]
    Unreachable(String),
    #[error("estado HTTP {0}")]
    Status(StatusCode),
    #[error("respuesta invalida: {0}")]
    InvalidResponse(String),
    #[error("URL invalida: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() {
            Self::Unreachable(error.to_string())
        } else if let Some(status) = error.status() {
            Self::Status(status)
        } else if error.is_builder() {
            Self::InvalidUrl(error.to_string())
        } else {
            Self::InvalidResponse(error.to_string())
        }
    }
}

/// Which leg of a request failed. A timeout while resolving is a gateway
/// timeout; a timeout while fetching the audio itself is reported as 408.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolve,
    Proxy,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub detail: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn from_upstream(error: &UpstreamError, phase: Phase) -> Self {
        let api_error = match (error, phase) {
            (UpstreamError::Timeout, Phase::Resolve) => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "El servidor tardo demasiado en responder. Intenta nuevamente.",
            ),
            (UpstreamError::Timeout, Phase::Proxy) => Self::new(
                StatusCode::REQUEST_TIMEOUT,
                "La descarga excedio el tiempo limite. El archivo puede ser demasiado grande.",
            ),
            (UpstreamError::Unreachable(_), Phase::Resolve) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "No se pudo conectar con el servidor de TikTok.",
            ),
            (UpstreamError::Unreachable(_), Phase::Proxy) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "No se pudo conectar con el servidor de audio.",
            ),
            (UpstreamError::Status(status), _) => Self::new(
                *status,
                format!(
                    "Error {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("respuesta inesperada")
                ),
            ),
            (UpstreamError::InvalidUrl(_), _) => Self::bad_request("La URL de audio no es valida."),
            (UpstreamError::InvalidResponse(_), Phase::Resolve) => {
                Self::internal("Ocurrio un error al procesar la solicitud.")
            }
            (UpstreamError::InvalidResponse(_), Phase::Proxy) => {
                Self::internal("No se pudo descargar el audio.")
            }
        };

        api_error.with_detail(error.to_string())
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Drops internal detail unless the deployment opted in.
    pub fn expose(mut self, expose_details: bool) -> Self {
        if !expose_details {
            self.detail = None;
        }
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            message: self.message,
            error: self.detail,
        });

        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_status_depends_on_phase() {
        let resolve = ApiError::from_upstream(&UpstreamError::Timeout, Phase::Resolve);
        let proxy = ApiError::from_upstream(&UpstreamError::Timeout, Phase::Proxy);
        assert_eq!(resolve.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(proxy.status, StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn upstream_status_is_propagated() {
        let error = ApiError::from_upstream(
            &UpstreamError::Status(StatusCode::FORBIDDEN),
            Phase::Proxy,
        );
        assert_eq!(error.status, StatusCode::FORBIDDEN);
        assert_eq!(error.message, "Error 403: Forbidden");
    }

    #[test]
    fn detail_is_hidden_unless_exposed() {
        let error = ApiError::from_upstream(
            &UpstreamError::Unreachable("dns error".to_string()),
            Phase::Resolve,
        );
        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(error.detail.is_some());
        assert!(error.expose(false).detail.is_none());
    }
}
