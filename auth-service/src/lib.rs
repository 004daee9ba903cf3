pub mod config;
pub mod db;
pub mod grpc;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
pub mod utils;

use std::sync::Arc;

use service_core::axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::config::AuthConfig;
use crate::services::{AuthService, Database, RedisService};

/// State shared by the HTTP handlers and the gRPC service.
///
/// `db` and `redis` are `None` when the service runs on in-memory backends.
#[derive(Clone)]
pub struct AppState {
    pub config: AuthConfig,
    pub auth: Arc<AuthService>,
    pub db: Option<Database>,
    pub redis: Option<RedisService>,
}

/// The small HTTP surface: health, metrics and the public key set.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks))
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            },
        ))
}
