//! Channel endpoints: listing, creation, reorder, update, delete.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;

use remus_core::storage::ChannelPositionUpdate;
use remus_core::{ChannelKind, ChannelRecord, Permission, PermissionOverrides, Store};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::gateway::protocol::ServerEvent;
use crate::gateway::rooms::RoomKey;
use crate::moderation;
use crate::state::AppState;

/// Channels the user can actually see.
pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(guild_id): Path<String>,
) -> ApiResult<Json<Vec<ChannelRecord>>> {
    require_membership(&state.store, &guild_id, &user.id)?;

    let mut visible = Vec::new();
    for channel in state.store.list_channels(&guild_id)? {
        if state
            .permissions(&user.id, Some(&channel.id))?
            .has(Permission::ViewChannels)
        {
            visible.push(channel);
        }
    }
    Ok(Json(visible))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannel {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub category_id: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(guild_id): Path<String>,
    Json(body): Json<CreateChannel>,
) -> ApiResult<(StatusCode, Json<ChannelRecord>)> {
    state.require(&user.id, Permission::ManageChannels, None)?;

    let name = body.name.trim();
    if name.is_empty() || name.len() > 100 {
        return Err(ApiError::BadRequest("channel name must be 1-100 characters".into()));
    }
    let category_id = body.category_id.as_deref().filter(|c| !c.is_empty());

    let channel = state
        .store
        .create_channel(&guild_id, name, body.kind, category_id, Some(&user.id))?;

    state.rooms.broadcast(
        &RoomKey::Guild(guild_id.clone()),
        ServerEvent::ChannelNew { channel: channel.clone() },
    );
    state.audit(
        "channel_create",
        Some(&user.id),
        Some(&channel.id),
        serde_json::json!({ "name": channel.name, "type": channel.kind.as_str() }),
    );
    Ok((StatusCode::CREATED, Json(channel)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderEntry {
    pub id: String,
    pub position: i64,
    /// `""` means "move to top level"; absent leaves the category alone.
    #[serde(default)]
    pub category_id: Option<String>,
}

/// Apply a reorder batch atomically, then emit `channel:update` for every
/// touched channel.
pub async fn reorder(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(guild_id): Path<String>,
    Json(batch): Json<Vec<ReorderEntry>>,
) -> ApiResult<StatusCode> {
    state.require(&user.id, Permission::ManageChannels, None)?;
    if batch.is_empty() {
        return Err(ApiError::BadRequest("empty reorder batch".into()));
    }

    let updates: Vec<ChannelPositionUpdate> = batch
        .iter()
        .map(|entry| ChannelPositionUpdate {
            id: entry.id.clone(),
            position: entry.position,
            category_id: entry.category_id.as_ref().map(|c| {
                if c.is_empty() {
                    None
                } else {
                    Some(c.clone())
                }
            }),
        })
        .collect();

    state.store.update_channel_positions(&guild_id, &updates)?;

    for entry in &batch {
        if let Some(channel) = state.store.get_channel(&entry.id)? {
            state.rooms.broadcast(
                &RoomKey::Guild(guild_id.clone()),
                ServerEvent::ChannelUpdate { channel },
            );
        }
    }
    state.audit(
        "channels_reorder",
        Some(&user.id),
        None,
        serde_json::json!({ "count": batch.len() }),
    );
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPatch {
    #[serde(default)]
    pub name: Option<String>,
    /// `""` clears the category.
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub permission_overrides: Option<PermissionOverrides>,
}

pub async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(channel_id): Path<String>,
    Json(patch): Json<ChannelPatch>,
) -> ApiResult<Json<ChannelRecord>> {
    state.require(&user.id, Permission::ManageChannels, Some(&channel_id))?;

    if let Some(name) = &patch.name {
        let name = name.trim();
        if name.is_empty() || name.len() > 100 {
            return Err(ApiError::BadRequest("channel name must be 1-100 characters".into()));
        }
    }
    let category_id = patch
        .category_id
        .as_ref()
        .map(|c| if c.is_empty() { None } else { Some(c.as_str()) });

    let channel = state.store.update_channel(
        &channel_id,
        patch.name.as_deref().map(str::trim),
        category_id,
        patch.permission_overrides.as_ref(),
    )?;

    state.rooms.broadcast(
        &RoomKey::Guild(channel.guild_id.clone()),
        ServerEvent::ChannelUpdate { channel: channel.clone() },
    );
    state.audit("channel_update", Some(&user.id), Some(&channel.id), serde_json::json!({}));
    Ok(Json(channel))
}

/// Delete a channel with full cascade: messages and upload rows go with
/// it, files are removed best-effort.
pub async fn remove(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(channel_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.require(&user.id, Permission::ManageChannels, Some(&channel_id))?;

    let (channel, uploads) = state.store.delete_channel(&channel_id)?;
    moderation::delete_upload_files(&state.config, &uploads);

    state.rooms.broadcast(
        &RoomKey::Guild(channel.guild_id.clone()),
        ServerEvent::ChannelDelete { channel_id: channel.id.clone() },
    );
    state.audit(
        "channel_delete",
        Some(&user.id),
        Some(&channel.id),
        serde_json::json!({ "name": channel.name, "uploadsRemoved": uploads.len() }),
    );
    Ok(StatusCode::NO_CONTENT)
}

fn require_membership(store: &Store, guild_id: &str, user_id: &str) -> ApiResult<()> {
    match store.get_member(guild_id, user_id)? {
        Some(_) => Ok(()),
        None => Err(ApiError::Forbidden("not a member".into())),
    }
}
