//! REST endpoints for tunnel creation.
//!
//! - `POST /api/tunnels`      — allocate a session record for an asset
//! - `GET  /api/tunnels/{id}` — inspect a record (credentials omitted)
//!
//! The relay itself is `GET /api/tunnels/{id}/ws`, see [`crate::ws`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error_response;
use crate::error::{Disconnect, DisconnectCode};
use crate::sessions::AccessMode;
use crate::AppState;

#[derive(Deserialize)]
pub struct CreateTunnelRequest {
    pub asset_id: String,
    #[serde(default)]
    pub mode: AccessMode,
}

/// `POST /api/tunnels` — create a pending tunnel for an active asset.
pub async fn create_tunnel(
    State(state): State<AppState>,
    Json(payload): Json<CreateTunnelRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let record = state
        .relay
        .create_tunnel(&payload.asset_id, payload.mode)
        .await
        .map_err(|d| {
            let status = match d.code {
                DisconnectCode::AssetNotFound => StatusCode::NOT_FOUND,
                DisconnectCode::AssetNotActive => StatusCode::CONFLICT,
                _ => StatusCode::BAD_REQUEST,
            };
            error_response(status, &d)
        })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "session_id": record.id,
            "asset_id": record.asset_id,
            "protocol": record.protocol,
            "mode": record.mode,
        })),
    ))
}

/// `GET /api/tunnels/{id}` — record lifecycle, connection id and outcome.
pub async fn get_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let record = state.relay.records().get(&id).await.ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            &Disconnect::new(
                DisconnectCode::SessionNotFound,
                format!("session {id} not found"),
            ),
        )
    })?;
    Ok(Json(json!(record)))
}
