//! REST endpoints for live session management.
//!
//! - `GET    /api/sessions`                              — list live sessions
//! - `DELETE /api/sessions/{id}`                         — force close
//! - `DELETE /api/sessions/{id}/observers/{observer_id}` — kick one observer

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use super::error_response;
use crate::error::{Disconnect, DisconnectCode};
use crate::AppState;

/// `GET /api/sessions` — live sessions with their observers.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let items = state.relay.sessions().list().await;
    let sessions: Vec<Value> = items
        .iter()
        .map(|s| {
            json!({
                "session_id": s.session_id,
                "protocol": s.protocol,
                "connection_id": s.connection_id,
                "mode": s.mode,
                "state": s.state,
                "created_at": s.created_at,
                "observer_count": s.observers.len(),
                "observers": s.observers,
            })
        })
        .collect();

    Json(json!({ "sessions": sessions }))
}

/// `DELETE /api/sessions/{id}` — close a session; its client receives
/// `FORCED_DISCONNECT`.
pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.relay.force_close(&id).await {
        Ok(Json(json!({ "session_id": id, "closed": true })))
    } else {
        Err(not_found(format!("session {id} not found")))
    }
}

/// `DELETE /api/sessions/{id}/observers/{observer_id}` — disconnect one
/// observer without touching the primary.
pub async fn kick_observer(
    State(state): State<AppState>,
    Path((id, observer_id)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.relay.kick_observer(&id, &observer_id).await {
        Ok(Json(json!({
            "session_id": id,
            "observer_id": observer_id,
            "closed": true,
        })))
    } else {
        Err(not_found(format!(
            "observer {observer_id} not found on session {id}"
        )))
    }
}

fn not_found(reason: String) -> (StatusCode, Json<Value>) {
    error_response(
        StatusCode::NOT_FOUND,
        &Disconnect::new(DisconnectCode::SessionNotFound, reason),
    )
}
