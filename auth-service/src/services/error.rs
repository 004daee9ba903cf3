use service_core::error::AppError;
use thiserror::Error;

/// Errors surfaced by the authentication core. One variant per error kind
/// callers can act on; everything else is `Internal`.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid or missing credentials")]
    Unauthorized,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account temporarily locked")]
    AccountLocked { retry_after: Option<u64> },

    #[error("Too many requests")]
    RateLimited { retry_after: Option<u64> },

    #[error("Session expired")]
    SessionExpired,

    #[error("Token expired")]
    TokenExpired,

    #[error("Session revoked")]
    SessionRevoked,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Idempotency key reused with a different request")]
    IdempotencyConflict,

    #[error("Use the OIDC authorize endpoint for provider sign-in")]
    OidcFlowRequired,

    #[error("Cannot unlink the last sign-in method")]
    CannotUnlinkLastMethod,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Snake-case error kind, used in logs and on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput(_) => "invalid_input",
            ServiceError::Unauthorized => "unauthorized",
            ServiceError::InvalidCredentials => "invalid_credentials",
            ServiceError::AccountLocked { .. } => "account_locked",
            ServiceError::RateLimited { .. } => "rate_limited",
            ServiceError::SessionExpired => "session_expired",
            ServiceError::TokenExpired => "token_expired",
            ServiceError::SessionRevoked => "session_revoked",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::IdempotencyConflict => "idempotency_conflict",
            ServiceError::OidcFlowRequired => "oidc_flow_required",
            ServiceError::CannotUnlinkLastMethod => "cannot_unlink_last_method",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::NotImplemented(_) => "not_implemented",
            ServiceError::Upstream(_) => "upstream",
            ServiceError::Internal(_) => "internal",
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ServiceError::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        ServiceError::Internal(anyhow::anyhow!("{}", msg))
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ServiceError::Conflict(msg),
            StoreError::NotFound(msg) => ServiceError::NotFound(msg),
            StoreError::Backend(e) => ServiceError::Internal(e),
        }
    }
}

impl From<service_core::context::ContextError> for ServiceError {
    fn from(err: service_core::context::ContextError) -> Self {
        ServiceError::Internal(anyhow::anyhow!(err))
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let kind = err.kind();
        match err {
            ServiceError::InvalidInput(msg) => AppError::BadRequest(kind, msg),
            ServiceError::OidcFlowRequired | ServiceError::CannotUnlinkLastMethod => {
                AppError::BadRequest(kind, err.to_string())
            }
            ServiceError::Unauthorized
            | ServiceError::InvalidCredentials
            | ServiceError::SessionExpired
            | ServiceError::TokenExpired
            | ServiceError::SessionRevoked => AppError::Unauthorized(kind, err.to_string()),
            ServiceError::AccountLocked { retry_after }
            | ServiceError::RateLimited { retry_after } => {
                AppError::TooManyRequests(kind, err.to_string(), retry_after)
            }
            ServiceError::Conflict(_) | ServiceError::IdempotencyConflict => {
                AppError::Conflict(kind, err.to_string())
            }
            ServiceError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            ServiceError::NotImplemented(msg) => AppError::NotImplemented(msg),
            ServiceError::Upstream(msg) => AppError::BadGateway(msg),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

/// Errors from the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store backend error: {0}")]
    Backend(anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            _ => StoreError::Backend(anyhow::Error::new(err)),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
pub type StoreResult<T> = Result<T, StoreError>;
