use crate::AppState;
use serde_json::json;
use service_core::axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

/// Liveness plus backend reachability. In-memory backends always report up.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.db {
        Some(db) => match db.health_check().await {
            Ok(()) => "up",
            Err(e) => {
                tracing::warn!(error = %e, "PostgreSQL health check failed");
                "down"
            }
        },
        None => "memory",
    };
    let redis = match &state.redis {
        Some(redis) => match redis.health_check().await {
            Ok(()) => "up",
            Err(e) => {
                tracing::warn!(error = %e, "Redis health check failed");
                "down"
            }
        },
        None => "memory",
    };

    let healthy = database != "down" && redis != "down";
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "service": state.config.service_name,
            "version": state.config.service_version,
            "environment": format!("{:?}", state.config.environment),
            "checks": {
                "postgres": database,
                "redis": redis,
            }
        })),
    )
}
