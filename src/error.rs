use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Gateway error surfaced to API callers. Variants map 1:1 onto HTTP
/// statuses; `Engine` and `Store` are kept apart so the lifecycle code can
/// tell which side of a partial failure it is compensating for.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("engine error: {0}")]
    Engine(#[source] anyhow::Error),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("{0}")]
    Internal(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Engine(_) | GatewayError::Store(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        GatewayError::BadRequest(message.into())
    }

    pub fn engine(error: impl Into<anyhow::Error>) -> Self {
        GatewayError::Engine(error.into())
    }

    pub fn store(error: impl Into<anyhow::Error>) -> Self {
        GatewayError::Store(error.into())
    }

    pub fn internal(error: impl Into<anyhow::Error>) -> Self {
        GatewayError::Internal(error.into())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("request failed: {self}");
        }
        (status, self.to_string()).into_response()
    }
}
