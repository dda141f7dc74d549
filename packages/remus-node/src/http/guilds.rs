//! Guild endpoints. Exactly one guild exists per node; the list endpoint
//! returns it fully aggregated (members, roles, channels, the caller's
//! effective permissions).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use remus_core::{ChannelRecord, GuildRecord, Permission, RoleRecord, Settings};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::gateway::protocol::ServerEvent;
use crate::gateway::rooms::RoomKey;
use crate::moderation;
use crate::state::AppState;
use crate::views::MemberView;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildView {
    #[serde(flatten)]
    pub guild: GuildRecord,
    pub members: Vec<MemberView>,
    pub roles: Vec<RoleRecord>,
    pub channels: Vec<ChannelRecord>,
    /// The requesting user's effective guild-wide permission mask.
    pub permissions: remus_core::Permissions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<GuildView>>> {
    let guild = state.store.node_guild()?;
    let guild_id = guild.id.clone();

    let members = state
        .store
        .list_members(&guild_id)?
        .into_iter()
        .map(|m| state.member_view(m))
        .collect();
    let channels = state.store.list_channels(&guild_id)?;
    let roles = state.store.list_roles(&guild_id)?;
    let permissions = state.permissions(&user.id, None)?;

    Ok(Json(vec![GuildView {
        guild,
        members,
        roles,
        channels,
        permissions,
        icon_url: state
            .config
            .server_icon
            .as_ref()
            .map(|_| "/api/server/icon".to_string()),
    }]))
}

/// Single-guild invariant: creating guilds over the API is not a thing.
pub async fn create_rejected() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(serde_json::json!({ "error": "this node hosts a single guild" })),
    )
}

pub async fn join(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(guild_id): Path<String>,
) -> ApiResult<Json<MemberView>> {
    if guild_id != state.store.node_guild_id()? {
        return Err(ApiError::NotFound("guild".into()));
    }

    let member = state.store.add_member(&guild_id, &user.id, None)?;
    let view = state.member_view(member);

    state.rooms.broadcast(
        &RoomKey::Guild(guild_id.clone()),
        ServerEvent::GuildMemberJoined { guild_id: guild_id.clone(), member: view.clone() },
    );
    state.audit("member_join", Some(&user.id), Some(&user.id), serde_json::json!({}));
    Ok(Json(view))
}

/// Leaving also purges the user's rows and files on this node.
pub async fn leave(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(guild_id): Path<String>,
) -> ApiResult<StatusCode> {
    if guild_id != state.store.node_guild_id()? {
        return Err(ApiError::NotFound("guild".into()));
    }
    state
        .store
        .get_member(&guild_id, &user.id)?
        .ok_or_else(|| ApiError::NotFound("member".into()))?;

    let uploads = state.store.purge_user(&user.id)?;
    moderation::delete_upload_files(&state.config, &uploads);

    state.rooms.broadcast(
        &RoomKey::Guild(guild_id.clone()),
        ServerEvent::GuildMemberLeft { guild_id: guild_id.clone(), user_id: user.id.clone() },
    );
    state.audit("member_leave", Some(&user.id), Some(&user.id), serde_json::json!({}));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_audit_limit() -> i64 {
    50
}

pub async fn audit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(guild_id): Path<String>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<remus_core::AuditRecord>>> {
    state.require(&user.id, Permission::ViewAuditLog, None)?;
    Ok(Json(state.store.list_audit(&guild_id, query.limit, query.offset)?))
}

pub async fn settings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(_guild_id): Path<String>,
) -> ApiResult<Json<Settings>> {
    state.require(&user.id, Permission::ManageServer, None)?;
    Ok(Json(state.store.get_settings()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub audit_max_entries: Option<i64>,
    pub timeout_max_minutes: Option<i64>,
}

pub async fn update_settings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(_guild_id): Path<String>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Json<Settings>> {
    state.require(&user.id, Permission::ManageServer, None)?;

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
    state.audit("settings_update", Some(&user.id), None, serde_json::json!(&settings));
    Ok(Json(settings))
}
