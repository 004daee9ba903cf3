//! Caller identity for gRPC endpoints.
//!
//! Calls that act on an existing session carry the session token in the
//! `authorization` metadata entry as `Bearer <token>`. Device details the
//! client did not send are filled from the transport.

use service_core::context::RequestContext;
use service_core::grpc::IntoStatus;
use service_core::error::AppError;
use tonic::{Request, Status};
use uuid::Uuid;

use super::proto::auth as pb;
use crate::models::DeviceContext;
use crate::services::{AuthService, ServiceError};

/// Map an orchestrator error onto the wire status.
pub fn status(err: ServiceError) -> Status {
    AppError::from(err).into_status()
}

/// Bearer token from the `authorization` metadata entry.
#[allow(clippy::result_large_err)]
pub fn bearer_token<T>(request: &Request<T>) -> Result<String, Status> {
    let raw = request
        .metadata()
        .get("authorization")
        .ok_or_else(|| Status::unauthenticated("Missing authorization metadata"))?
        .to_str()
        .map_err(|_| Status::unauthenticated("Invalid authorization metadata encoding"))?;

    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(str::trim)
        .ok_or_else(|| Status::unauthenticated("Invalid Bearer token format"))?;

    if token.is_empty() {
        return Err(Status::unauthenticated("Empty Bearer token"));
    }
    Ok(token.to_string())
}

/// Validate the bearer token and return the signed-in user.
pub async fn authenticated_user<T>(
    auth: &AuthService,
    ctx: &RequestContext,
    request: &Request<T>,
) -> Result<Uuid, Status> {
    let token = bearer_token(request)?;
    let claims = auth.validate_token(ctx, &token).await.map_err(status)?;
    Uuid::parse_str(&claims.user_id).map_err(|_| Status::unauthenticated("Invalid token subject"))
}

/// Device details from the message, with the peer address and user agent as fallbacks.
pub fn device_context<T>(request: &Request<T>, device: Option<&pb::DeviceContext>) -> DeviceContext {
    let mut out = device
        .map(|d| DeviceContext {
            device_name: d.device_name.clone(),
            device_os: d.device_os.clone(),
            ip_address: d.ip_address.clone(),
            user_agent: d.user_agent.clone(),
        })
        .unwrap_or_default();

    if out.ip_address.is_empty() {
        out.ip_address = peer_ip(request);
    }
    if out.user_agent.is_empty() {
        out.user_agent = request
            .metadata()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
    }
    out
}

/// Client IP: first `x-forwarded-for` hop, else the transport peer.
pub fn peer_ip<T>(request: &Request<T>) -> String {
    request
        .metadata()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| request.remote_addr().map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}
