use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Mesh-wide error type.
///
/// Variants carrying a `&'static str` code expose that code to callers so they
/// can tell, for example, an expired session from a revoked one. Everything
/// else is rendered with a generic message and the detail is only logged.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request ({0}): {1}")]
    BadRequest(&'static str, String),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized ({0}): {1}")]
    Unauthorized(&'static str, String),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Conflict ({0}): {1}")]
    Conflict(&'static str, String),

    #[error("Too many requests ({0}): {1}")]
    TooManyRequests(&'static str, String, Option<u64>),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "invalid_input",
            AppError::BadRequest(code, _) => *code,
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized(code, _) => *code,
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(code, _) => *code,
            AppError::TooManyRequests(code, _, _) => *code,
            AppError::NotImplemented(_) => "not_implemented",
            AppError::BadGateway(_) => "upstream_unavailable",
            AppError::ServiceUnavailable => "unavailable",
            AppError::InvalidToken(_) => "unauthorized",
            AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::RedisError(_)
            | AppError::ConfigError(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let code = self.code();
        let (status, error_message, details, retry_after) = match self {
            AppError::ValidationError(err) => (
                StatusCode::BAD_REQUEST,
                "Validation error".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::BadRequest(_, msg) => (StatusCode::BAD_REQUEST, msg, None, None),
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string(), None, None),
            AppError::Unauthorized(_, msg) => (StatusCode::UNAUTHORIZED, msg, None, None),
            AppError::Forbidden(err) => (StatusCode::FORBIDDEN, err.to_string(), None, None),
            AppError::Conflict(_, msg) => (StatusCode::CONFLICT, msg, None, None),
            AppError::TooManyRequests(_, msg, retry) => {
                (StatusCode::TOO_MANY_REQUESTS, msg, None, retry)
            }
            AppError::NotImplemented(msg) => (StatusCode::NOT_IMPLEMENTED, msg, None, None),
            AppError::BadGateway(msg) => {
                tracing::error!(error = %msg, "Upstream failure");
                (
                    StatusCode::BAD_GATEWAY,
                    "Upstream service unavailable".to_string(),
                    None,
                    None,
                )
            }
            AppError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
                None,
                None,
            ),
            AppError::InvalidToken(_) => (
                StatusCode::UNAUTHORIZED,
                "Invalid or missing credentials".to_string(),
                None,
                None,
            ),
            internal @ (AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::RedisError(_)
            | AppError::ConfigError(_)) => {
                tracing::error!(error = %internal, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                    None,
                )
            }
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                error: error_message,
                code,
                details,
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}
