//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. [`router`] wires
//! them, plus the WebSocket upgrades from [`crate::ws`], into one app.

pub mod health;
pub mod sessions;
pub mod tunnels;

use axum::{
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::error::Disconnect;
use crate::{ws, AppState};

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/tunnels", post(tunnels::create_tunnel))
        .route("/api/tunnels/{id}", get(tunnels::get_tunnel))
        .route("/api/tunnels/{id}/ws", get(ws::primary_upgrade))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/{id}", delete(sessions::close_session))
        .route("/api/sessions/{id}/observe", get(ws::observer_upgrade))
        .route(
            "/api/sessions/{id}/observers/{observer_id}",
            delete(sessions::kick_observer),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error body: `{"error", "code", "status"}`.
pub(crate) fn error_response(
    status: StatusCode,
    disconnect: &Disconnect,
) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({
            "error": disconnect.reason,
            "code": disconnect.code.as_str(),
            "status": disconnect.code.code(),
        })),
    )
}
