//! Member endpoints: listing, nickname/roles/timeout/voice patches, and
//! the moderation verbs (kick, ban, move).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;

use remus_core::{permissions, ChannelKind, Permission};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::gateway::protocol::ServerEvent;
use crate::gateway::rooms::RoomKey;
use crate::moderation;
use crate::state::AppState;
use crate::views::MemberView;

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(guild_id): Path<String>,
) -> ApiResult<Json<Vec<MemberView>>> {
    if state.store.get_member(&guild_id, &user.id)?.is_none() {
        return Err(ApiError::Forbidden("not a member".into()));
    }
    let members = state
        .store
        .list_members(&guild_id)?
        .into_iter()
        .map(|m| state.member_view(m))
        .collect();
    Ok(Json(members))
}

#[derive(Debug, Deserialize)]
pub struct NicknamePatch {
    #[serde(default)]
    pub nickname: Option<String>,
}

pub async fn nickname(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((guild_id, user_id)): Path<(String, String)>,
    Json(patch): Json<NicknamePatch>,
) -> ApiResult<Json<MemberView>> {
    // Changing your own nickname is always allowed; others need
    // MANAGE_SERVER and a higher position.
    if user.id != user_id {
        state.require(&user.id, Permission::ManageServer, None)?;
        state.require_outranks(&user.id, &user_id)?;
    }

    let nickname = patch
        .nickname
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    if nickname.is_some_and(|n| n.len() > 64) {
        return Err(ApiError::BadRequest("nickname must be at most 64 characters".into()));
    }

    state.store.update_member_nickname(&guild_id, &user_id, nickname)?;
    emit_member_update(&state, &guild_id, &user_id)?;
    state.audit("member_nickname", Some(&user.id), Some(&user_id), serde_json::json!({}));
    member_json(&state, &guild_id, &user_id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolesPatch {
    pub role_ids: Vec<String>,
}

pub async fn roles(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((guild_id, user_id)): Path<(String, String)>,
    Json(patch): Json<RolesPatch>,
) -> ApiResult<Json<MemberView>> {
    state.require(&user.id, Permission::ManageRoles, None)?;
    state.require_outranks(&user.id, &user_id)?;

    let target = state
        .store
        .get_member(&guild_id, &user_id)?
        .ok_or_else(|| ApiError::NotFound("member".into()))?;
    let actor = state
        .store
        .get_member(&guild_id, &user.id)?
        .ok_or_else(|| ApiError::Forbidden("not a member".into()))?;
    let all_roles = state.store.list_roles(&guild_id)?;

    // Every role being granted or revoked must itself be manageable.
    for role in &all_roles {
        let had = target.role_ids.contains(&role.id);
        let has = patch.role_ids.contains(&role.id);
        if had != has && !permissions::can_manage_role(&actor, role, &guild_id, &all_roles) {
            return Err(ApiError::Forbidden(format!("role '{}' outranks you", role.name)));
        }
    }

    state.store.update_member_roles(&guild_id, &user_id, &patch.role_ids)?;
    emit_member_update(&state, &guild_id, &user_id)?;
    state.audit(
        "member_roles",
        Some(&user.id),
        Some(&user_id),
        serde_json::json!({ "roleIds": patch.role_ids }),
    );
    member_json(&state, &guild_id, &user_id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutPatch {
    /// Minutes from now; null or absent clears the timeout.
    #[serde(default)]
    pub duration_minutes: Option<i64>,
}

pub async fn timeout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((guild_id, user_id)): Path<(String, String)>,
    Json(patch): Json<TimeoutPatch>,
) -> ApiResult<Json<MemberView>> {
    state.require(&user.id, Permission::TimeoutMembers, None)?;
    state.require_outranks(&user.id, &user_id)?;

    let timeout_until = match patch.duration_minutes {
        Some(minutes) => {
            if minutes < 1 {
                return Err(ApiError::BadRequest("durationMinutes must be positive".into()));
            }
            let max = state.store.get_settings()?.timeout_max_minutes;
            if minutes > max {
                return Err(ApiError::BadRequest(format!(
                    "timeout exceeds the {max} minute maximum"
                )));
            }
            Some(remus_core::time::now_millis() + minutes * 60 * 1000)
        }
        None => None,
    };

    state.store.update_member_timeout(&guild_id, &user_id, timeout_until)?;
    emit_member_update(&state, &guild_id, &user_id)?;
    state.audit(
        "member_timeout",
        Some(&user.id),
        Some(&user_id),
        serde_json::json!({ "durationMinutes": patch.duration_minutes }),
    );
    member_json(&state, &guild_id, &user_id)
}

#[derive(Debug, Deserialize)]
pub struct VoicePatch {
    #[serde(default)]
    pub muted: Option<bool>,
    #[serde(default)]
    pub deafened: Option<bool>,
}

pub async fn voice(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((guild_id, user_id)): Path<(String, String)>,
    Json(patch): Json<VoicePatch>,
) -> ApiResult<Json<MemberView>> {
    if patch.muted.is_some() {
        state.require(&user.id, Permission::VoiceMuteMembers, None)?;
    }
    if patch.deafened.is_some() {
        state.require(&user.id, Permission::VoiceDeafenMembers, None)?;
    }
    if patch.muted.is_none() && patch.deafened.is_none() {
        return Err(ApiError::BadRequest("nothing to change".into()));
    }
    state.require_outranks(&user.id, &user_id)?;

    let member = state
        .store
        .update_member_voice(&guild_id, &user_id, patch.muted, patch.deafened)?;

    // Server mute closes the user's live audio producers immediately.
    if member.voice_muted && patch.muted == Some(true) {
        state.voice.force_mute_user(&user_id).await;
    }

    emit_member_update(&state, &guild_id, &user_id)?;
    state.audit(
        "member_voice",
        Some(&user.id),
        Some(&user_id),
        serde_json::json!({ "muted": patch.muted, "deafened": patch.deafened }),
    );
    Ok(Json(state.member_view(member)))
}

pub async fn kick(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((guild_id, user_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.require(&user.id, Permission::KickMembers, None)?;
    state.require_outranks(&user.id, &user_id)?;
    if user.id == user_id {
        return Err(ApiError::BadRequest("use leave instead".into()));
    }

    moderation::kick_user(&state, &user.id, &guild_id, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct BanBody {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn ban(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((guild_id, user_id)): Path<(String, String)>,
    Json(body): Json<BanBody>,
) -> ApiResult<StatusCode> {
    state.require(&user.id, Permission::BanMembers, None)?;
    state.require_outranks(&user.id, &user_id)?;
    if user.id == user_id {
        return Err(ApiError::BadRequest("you cannot ban yourself".into()));
    }

    moderation::ban_user(&state, &user.id, &guild_id, &user_id, body.reason.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveBody {
    pub channel_id: String,
}

pub async fn move_voice(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((guild_id, user_id)): Path<(String, String)>,
    Json(body): Json<MoveBody>,
) -> ApiResult<StatusCode> {
    state.require(&user.id, Permission::VoiceMoveMembers, None)?;
    state.require_outranks(&user.id, &user_id)?;

    let channel = state
        .store
        .get_channel(&body.channel_id)?
        .ok_or_else(|| ApiError::NotFound("channel".into()))?;
    if channel.guild_id != guild_id || channel.kind != ChannelKind::Voice {
        return Err(ApiError::BadRequest("target must be a voice channel".into()));
    }

    state.voice.move_user(&user_id, &channel.id);
    state.audit(
        "member_move",
        Some(&user.id),
        Some(&user_id),
        serde_json::json!({ "channelId": channel.id }),
    );
    Ok(StatusCode::NO_CONTENT)
}

fn emit_member_update(state: &AppState, guild_id: &str, user_id: &str) -> ApiResult<()> {
    if let Some(member) = state.store.get_member(guild_id, user_id)? {
        state.rooms.broadcast(
            &RoomKey::Guild(guild_id.to_string()),
            ServerEvent::MemberUpdate {
                guild_id: guild_id.to_string(),
                member: state.member_view(member),
            },
        );
    }
    Ok(())
}

fn member_json(state: &AppState, guild_id: &str, user_id: &str) -> ApiResult<Json<MemberView>> {
    let member = state
        .store
        .get_member(guild_id, user_id)?
        .ok_or_else(|| ApiError::NotFound("member".into()))?;
    Ok(Json(state.member_view(member)))
}
