use crate::AppState;
use service_core::axum::{extract::State, http::header, response::IntoResponse, Json};

/// Public signing keys, so peers can verify session tokens locally.
pub async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    let jwks = state.auth.public_keys();
    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "public, max-age=300"),
        ],
        Json(jwks),
    )
}
