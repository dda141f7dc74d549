//! Message endpoints. The socket path shares the same validation; both
//! end in a `message:new` / `message:delete` broadcast.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;

use remus_core::{ChannelKind, Permission};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::gateway::protocol::ServerEvent;
use crate::gateway::rooms::RoomKey;
use crate::moderation;
use crate::state::AppState;
use crate::views::MessageView;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub before: Option<String>,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(channel_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<MessageView>>> {
    let perms = state.permissions(&user.id, Some(&channel_id))?;
    if !perms.has(Permission::ViewChannels) || !perms.has(Permission::ReadHistory) {
        return Err(ApiError::forbidden());
    }

    let page = state
        .store
        .list_messages(&channel_id, query.limit, query.before.as_deref())?;
    Ok(Json(page.into_iter().map(|m| state.message_view(m)).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessage {
    #[serde(default)]
    pub content: String,
    /// Upload ids returned by `/api/files/upload`.
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(channel_id): Path<String>,
    Json(body): Json<CreateMessage>,
) -> ApiResult<(StatusCode, Json<MessageView>)> {
    let channel = state
        .store
        .get_channel(&channel_id)?
        .ok_or_else(|| ApiError::NotFound("channel".into()))?;
    if channel.kind != ChannelKind::Text {
        return Err(ApiError::BadRequest("messages go to text channels".into()));
    }

    let perms = state.permissions(&user.id, Some(&channel_id))?;
    if !perms.has(Permission::ViewChannels) || !perms.has(Permission::SendMessages) {
        return Err(ApiError::forbidden());
    }
    if !body.attachments.is_empty() && !perms.has(Permission::AttachFiles) {
        return Err(ApiError::forbidden());
    }

    let uploads = state
        .store
        .resolve_attachments(&channel_id, &user.id, &body.attachments)?;
    let attachments: Vec<_> = uploads.iter().map(|u| u.attachment_ref()).collect();

    if body.content.trim().is_empty() && attachments.is_empty() {
        return Err(ApiError::BadRequest("message needs content or attachments".into()));
    }

    let message = state.store.create_message(
        &channel_id,
        &user.id,
        &body.content,
        attachments,
        body.reply_to_id.as_deref(),
    )?;
    let view = state.message_view(message);

    state.rooms.broadcast(
        &RoomKey::Channel(channel_id.clone()),
        ServerEvent::MessageNew { message: view.clone() },
    );
    Ok((StatusCode::CREATED, Json(view)))
}

/// Authors delete their own messages; MANAGE_MESSAGES deletes anyone's.
pub async fn remove(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((channel_id, message_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let message = state
        .store
        .get_message(&message_id)?
        .ok_or_else(|| ApiError::NotFound("message".into()))?;
    if message.channel_id != channel_id {
        return Err(ApiError::NotFound("message".into()));
    }

    let is_author = message.author_id == user.id;
    if !is_author {
        state.require(&user.id, Permission::ManageMessages, Some(&channel_id))?;
    }

    let removed = state.store.delete_message(&message_id)?;
    moderation::delete_attachment_files(&state.config, &removed.attachments);

    state.rooms.broadcast(
        &RoomKey::Channel(channel_id.clone()),
        ServerEvent::MessageDelete { channel_id: channel_id.clone(), message_id },
    );
    if !is_author {
        state.audit(
            "message_delete",
            Some(&user.id),
            Some(&removed.author_id),
            serde_json::json!({ "channelId": channel_id }),
        );
    }
    Ok(StatusCode::NO_CONTENT)
}
