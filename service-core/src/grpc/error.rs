//! Error conversion between `AppError` and `tonic::Status`.
//!
//! | AppError | gRPC Status |
//! |----------|-------------|
//! | `ValidationError` / `BadRequest` | `INVALID_ARGUMENT` |
//! | `NotFound` | `NOT_FOUND` |
//! | `Unauthorized` / `InvalidToken` | `UNAUTHENTICATED` |
//! | `Forbidden` | `PERMISSION_DENIED` |
//! | `Conflict` | `ALREADY_EXISTS` |
//! | `TooManyRequests` | `RESOURCE_EXHAUSTED` |
//! | `NotImplemented` | `UNIMPLEMENTED` |
//! | `BadGateway` / `ServiceUnavailable` | `UNAVAILABLE` |
//! | everything else | `INTERNAL` |
//!
//! The error code travels in the `x-error-code` metadata entry.

use tonic::{Code, Status};

use crate::error::AppError;

pub const ERROR_CODE_METADATA: &str = "x-error-code";

/// Extension trait for converting types into `tonic::Status`.
pub trait IntoStatus {
    fn into_status(self) -> Status;
}

impl IntoStatus for AppError {
    fn into_status(self) -> Status {
        let code = self.code();
        let mut status = match self {
            AppError::ValidationError(err) => {
                Status::invalid_argument(format!("Validation error: {}", err))
            }
            AppError::BadRequest(_, msg) => Status::invalid_argument(msg),
            AppError::NotFound(err) => Status::not_found(err.to_string()),
            AppError::Unauthorized(_, msg) => Status::unauthenticated(msg),
            AppError::Forbidden(err) => Status::permission_denied(err.to_string()),
            AppError::Conflict(_, msg) => Status::already_exists(msg),
            AppError::TooManyRequests(_, msg, retry_after) => {
                let mut status = Status::resource_exhausted(msg);
                if let Some(seconds) = retry_after
                    && let Ok(value) = seconds.to_string().parse()
                {
                    status.metadata_mut().insert("retry-after", value);
                }
                status
            }
            AppError::NotImplemented(msg) => Status::unimplemented(msg),
            AppError::BadGateway(msg) => {
                tracing::error!(error = %msg, "Upstream failure");
                Status::unavailable("Upstream service unavailable")
            }
            AppError::ServiceUnavailable => Status::unavailable("Service unavailable"),
            AppError::InvalidToken(_) => Status::unauthenticated("Invalid or missing credentials"),
            // Log the full error but don't expose it to clients
            internal @ (AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::RedisError(_)
            | AppError::ConfigError(_)) => {
                tracing::error!(error = %internal, "Internal error");
                Status::internal("Internal server error")
            }
        };

        if let Ok(value) = code.parse() {
            status.metadata_mut().insert(ERROR_CODE_METADATA, value);
        }
        status
    }
}

impl From<AppError> for Status {
    fn from(err: AppError) -> Self {
        err.into_status()
    }
}

/// Convert a `tonic::Status` received from a peer back to an `AppError`.
impl From<Status> for AppError {
    fn from(status: Status) -> Self {
        let code = status
            .metadata()
            .get(ERROR_CODE_METADATA)
            .and_then(|v| v.to_str().ok())
            .map(intern_code);

        match status.code() {
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
                AppError::BadRequest(
                    code.unwrap_or("invalid_input"),
                    status.message().to_string(),
                )
            }
            Code::NotFound => AppError::NotFound(anyhow::anyhow!("{}", status.message())),
            Code::Unauthenticated => AppError::Unauthorized(
                code.unwrap_or("unauthorized"),
                status.message().to_string(),
            ),
            Code::PermissionDenied => AppError::Forbidden(anyhow::anyhow!("{}", status.message())),
            Code::AlreadyExists => {
                AppError::Conflict(code.unwrap_or("conflict"), status.message().to_string())
            }
            Code::ResourceExhausted => {
                let retry_after = status
                    .metadata()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse().ok());
                AppError::TooManyRequests(
                    code.unwrap_or("rate_limited"),
                    status.message().to_string(),
                    retry_after,
                )
            }
            Code::Unimplemented => AppError::NotImplemented(status.message().to_string()),
            Code::Unavailable => AppError::ServiceUnavailable,
            Code::Internal | Code::Unknown | Code::DataLoss => {
                AppError::InternalError(anyhow::anyhow!("{}", status.message()))
            }
            Code::Aborted | Code::Cancelled | Code::DeadlineExceeded => {
                AppError::InternalError(anyhow::anyhow!("Request failed: {}", status.message()))
            }
            Code::Ok => AppError::InternalError(anyhow::anyhow!("Unexpected OK status as error")),
        }
    }
}

/// Map a wire code back onto the static set this mesh emits.
fn intern_code(code: &str) -> &'static str {
    match code {
        "invalid_input" => "invalid_input",
        "unauthorized" => "unauthorized",
        "invalid_credentials" => "invalid_credentials",
        "account_locked" => "account_locked",
        "rate_limited" => "rate_limited",
        "session_expired" => "session_expired",
        "token_expired" => "token_expired",
        "session_revoked" => "session_revoked",
        "conflict" => "conflict",
        "idempotency_conflict" => "idempotency_conflict",
        "oidc_flow_required" => "oidc_flow_required",
        "cannot_unlink_last_method" => "cannot_unlink_last_method",
        _ => "unknown",
    }
}

/// Result type alias for gRPC handlers.
pub type GrpcResult<T> = Result<tonic::Response<T>, Status>;
