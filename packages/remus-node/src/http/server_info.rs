//! Public endpoints: liveness, server metadata, and the server icon.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "remus-node",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Server metadata for discovery and client bootstrap. `serverId` is the
/// first 8 characters of the guild id.
pub async fn info(State(state): State<AppState>) -> impl IntoResponse {
    let server_id = state
        .store
        .node_guild_id()
        .map(|id| id.chars().take(8).collect::<String>())
        .unwrap_or_default();

    Json(json!({
        "name": state.config.server_name,
        "publicUrl": state.config.public_url,
        "serverId": server_id,
        "region": state.config.region,
        "mainBackendUrl": state.config.main_backend_url,
        "iconUrl": state.config.server_icon.as_ref().map(|_| "/api/server/icon"),
        "iceServers": state.config.ice_servers,
    }))
}

/// Raw icon bytes with inferred MIME.
pub async fn icon(State(state): State<AppState>) -> impl IntoResponse {
    let Some(path) = state.config.server_icon.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                mime.as_ref().parse().unwrap_or(header::HeaderValue::from_static(
                    "application/octet-stream",
                )),
            );
            (StatusCode::OK, headers, Body::from(bytes)).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
