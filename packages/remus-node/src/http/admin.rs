//! Operator API.
//!
//! Only reachable from loopback, and only when `REMUS_ADMIN_KEY` is set;
//! every request must carry the matching `X-Remus-Admin-Key` header. With
//! no key configured the whole surface answers 404, indistinguishable
//! from not existing.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use remus_core::storage::RoleUpdate;
use remus_core::Permissions;

use crate::error::{ApiError, ApiResult};
use crate::gateway::protocol::ServerEvent;
use crate::gateway::rooms::RoomKey;
use crate::moderation;
use crate::state::AppState;

const ADMIN_KEY_HEADER: &str = "x-remus-admin-key";

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/admin/overview", get(overview))
        .route("/api/admin/users", get(users))
        .route("/api/admin/users/:user_id/ban", post(ban))
        .route("/api/admin/users/:user_id/unban", post(unban))
        .route("/api/admin/bans", get(bans))
        .route("/api/admin/members", get(members))
        .route("/api/admin/roles", get(roles))
        .route("/api/admin/roles/:role_id", axum::routing::patch(update_role))
        .route("/api/admin/audit", get(audit))
        .route(
            "/api/admin/settings",
            get(settings).patch(update_settings),
        )
        .route("/api/admin/messages/:message_id", delete(delete_message))
        .route("/api/admin/uploads/:upload_id", delete(delete_upload))
        .layer(middleware::from_fn_with_state(state, admin_gate))
}

/// Loopback source + matching key, or nothing.
async fn admin_gate(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.admin_key.as_deref() else {
        return Err(ApiError::NotFound("route".into()));
    };

    let is_loopback = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .is_some_and(|info| info.0.ip().is_loopback());
    if !is_loopback {
        return Err(ApiError::Forbidden("admin API is loopback-only".into()));
    }

    let presented = request
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != expected {
        return Err(ApiError::Forbidden("bad admin key".into()));
    }

    Ok(next.run(request).await)
}

async fn overview(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let guild = state.store.node_guild()?;
    Ok(Json(json!({
        "guild": guild,
        "members": state.store.list_members(&guild.id)?.len(),
        "channels": state.store.list_channels(&guild.id)?.len(),
        "roles": state.store.list_roles(&guild.id)?.len(),
        "bans": state.store.list_bans()?.len(),
        "connectedSockets": state.rooms.connected_count(),
    })))
}

async fn users(State(state): State<AppState>) -> ApiResult<Json<Vec<remus_core::ProfileRecord>>> {
    Ok(Json(state.store.list_profiles()?))
}

#[derive(Debug, Deserialize)]
struct BanBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn ban(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    body: Option<Json<BanBody>>,
) -> ApiResult<StatusCode> {
    let guild_id = state.store.node_guild_id()?;
    let reason = body.as_ref().and_then(|b| b.reason.as_deref());
    moderation::ban_user(&state, "admin", &guild_id, &user_id, reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unban(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult<StatusCode> {
    if moderation::unban_user(&state, "admin", &user_id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("ban".into()))
    }
}

async fn bans(State(state): State<AppState>) -> ApiResult<Json<Vec<remus_core::BanRecord>>> {
    Ok(Json(state.store.list_bans()?))
}

async fn members(State(state): State<AppState>) -> ApiResult<Json<Vec<crate::views::MemberView>>> {
    let guild_id = state.store.node_guild_id()?;
    let members = state
        .store
        .list_members(&guild_id)?
        .into_iter()
        .map(|m| state.member_view(m))
        .collect();
    Ok(Json(members))
}

async fn roles(State(state): State<AppState>) -> ApiResult<Json<Vec<remus_core::RoleRecord>>> {
    let guild_id = state.store.node_guild_id()?;
    Ok(Json(state.store.list_roles(&guild_id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminRolePatch {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    permissions: Option<Permissions>,
    #[serde(default)]
    position: Option<i64>,
}

async fn update_role(
    State(state): State<AppState>,
    Path(role_id): Path<String>,
    Json(patch): Json<AdminRolePatch>,
) -> ApiResult<Json<remus_core::RoleRecord>> {
    let role = state.store.update_role(
        &role_id,
        RoleUpdate {
            name: patch.name,
            permissions: patch.permissions,
            position: patch.position,
            ..RoleUpdate::default()
        },
    )?;
    state.audit("role_update", None, Some(&role.id), json!({ "via": "admin" }));
    Ok(Json(role))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_audit_limit() -> i64 {
    100
}

async fn audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<remus_core::AuditRecord>>> {
    let guild_id = state.store.node_guild_id()?;
    Ok(Json(state.store.list_audit(&guild_id, query.limit, query.offset)?))
}

async fn settings(State(state): State<AppState>) -> ApiResult<Json<remus_core::Settings>> {
    Ok(Json(state.store.get_settings()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsPatch {
    #[serde(default)]
    audit_max_entries: Option<i64>,
    #[serde(default)]
    timeout_max_minutes: Option<i64>,
}

async fn update_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Json<remus_core::Settings>> {
    let mut settings = state.store.get_settings()?;
    if let Some(max) = patch.audit_max_entries {
        if max < 1 {
            return Err(ApiError::BadRequest("auditMaxEntries must be at least 1".into()));
        }
        settings.audit_max_entries = max;
    }
    if let Some(max) = patch.timeout_max_minutes {
        if max < 1 {
            return Err(ApiError::BadRequest("timeoutMaxMinutes must be at least 1".into()));
        }
        settings.timeout_max_minutes = max;
    }
    state.store.update_settings(&settings)?;
    state.audit("settings_update", None, None, json!({ "via": "admin" }));
    Ok(Json(settings))
}

async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> ApiResult<StatusCode> {
    let removed = state.store.delete_message(&message_id)?;
    moderation::delete_attachment_files(&state.config, &removed.attachments);
    state.rooms.broadcast(
        &RoomKey::Channel(removed.channel_id.clone()),
        ServerEvent::MessageDelete {
            channel_id: removed.channel_id.clone(),
            message_id: removed.id,
        },
    );
    state.audit("message_delete", None, Some(&removed.author_id), json!({ "via": "admin" }));
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<StatusCode> {
    let upload = state
        .store
        .get_upload(&upload_id)?
        .ok_or_else(|| ApiError::NotFound("upload".into()))?;
    moderation::delete_upload_files(&state.config, std::slice::from_ref(&upload));
    // Reuse the message-deletion scrub: remove the row directly.
    state.store.delete_upload_row(&upload_id)?;
    state.audit("upload_delete", None, Some(&upload.author_id), json!({ "via": "admin" }));
    Ok(StatusCode::NO_CONTENT)
}
