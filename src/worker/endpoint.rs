use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use crate::status::StatusHandle;

#[derive(Clone)]
struct EndpointState {
    status: StatusHandle,
    token: Option<String>,
}

/// Read-only status endpoint. The token is checked before anything else; a
/// mismatch yields an empty 401. Unknown paths fall through to axum's 404.
pub fn build_router(status: StatusHandle, token: Option<String>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(EndpointState { status, token })
}

async fn get_status(State(state): State<EndpointState>, headers: HeaderMap) -> Response {
    if let Some(expected) = &state.token {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    Json(state.status.snapshot()).into_response()
}
