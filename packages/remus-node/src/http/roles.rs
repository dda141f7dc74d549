//! Role endpoints: CRUD plus icon upload. Hierarchy gating applies to
//! every mutation: a role is only touchable from a strictly higher
//! position (or with ADMINISTRATOR; `@everyone` additionally answers to
//! MANAGE_SERVER).

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;

use remus_core::storage::RoleUpdate;
use remus_core::{permissions, Permission, Permissions, RoleRecord};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Role icons are small; 2 MB is plenty.
pub const ICON_LIMIT_BYTES: usize = 2 * 1024 * 1024;

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(guild_id): Path<String>,
) -> ApiResult<Json<Vec<RoleRecord>>> {
    if state.store.get_member(&guild_id, &user.id)?.is_none() {
        return Err(ApiError::Forbidden("not a member".into()));
    }
    Ok(Json(state.store.list_roles(&guild_id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRole {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    #[serde(default)]
    pub hoist: bool,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(guild_id): Path<String>,
    Json(body): Json<CreateRole>,
) -> ApiResult<(StatusCode, Json<RoleRecord>)> {
    state.require(&user.id, Permission::ManageRoles, None)?;

    let name = body.name.trim();
    if name.is_empty() || name.len() > 100 {
        return Err(ApiError::BadRequest("role name must be 1-100 characters".into()));
    }

    let role = state.store.create_role(
        &guild_id,
        name,
        body.color.as_deref(),
        body.permissions.unwrap_or(Permissions::NONE),
        body.hoist,
    )?;
    state.audit(
        "role_create",
        Some(&user.id),
        Some(&role.id),
        serde_json::json!({ "name": role.name }),
    );
    Ok((StatusCode::CREATED, Json(role)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<Option<String>>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    #[serde(default)]
    pub hoist: Option<bool>,
    #[serde(default)]
    pub position: Option<i64>,
}

pub async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(role_id): Path<String>,
    Json(patch): Json<RolePatch>,
) -> ApiResult<Json<RoleRecord>> {
    state.require(&user.id, Permission::ManageRoles, None)?;
    let role = require_role_authority(&state, &user.id, &role_id)?;

    if let Some(name) = &patch.name {
        if name.trim().is_empty() {
            return Err(ApiError::BadRequest("role name cannot be empty".into()));
        }
    }

    let updated = state.store.update_role(
        &role.id,
        RoleUpdate {
            name: patch.name.map(|n| n.trim().to_string()),
            color: patch.color,
            permissions: patch.permissions,
            hoist: patch.hoist,
            position: patch.position,
        },
    )?;
    state.audit("role_update", Some(&user.id), Some(&updated.id), serde_json::json!({}));
    Ok(Json(updated))
}

pub async fn remove(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(role_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.require(&user.id, Permission::ManageRoles, None)?;
    require_role_authority(&state, &user.id, &role_id)?;

    let role = state.store.delete_role(&role_id)?;
    state.audit(
        "role_delete",
        Some(&user.id),
        Some(&role.id),
        serde_json::json!({ "name": role.name }),
    );
    Ok(StatusCode::NO_CONTENT)
}

/// Multipart icon upload (≤2 MB, images only).
pub async fn upload_icon(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(role_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<RoleRecord>> {
    state.require(&user.id, Permission::ManageRoles, None)?;
    let role = require_role_authority(&state, &user.id, &role_id)?;

    let mut data: Option<(Vec<u8>, String)> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|_| ApiError::UploadTooLarge("icon exceeds the 2 MB limit".into()))?;
        data = Some((bytes.to_vec(), content_type));
    }

    let (bytes, content_type) = data.ok_or_else(|| ApiError::BadRequest("missing file field".into()))?;
    if !content_type.starts_with("image/") {
        return Err(ApiError::BadRequest("role icons must be images".into()));
    }
    if bytes.len() > ICON_LIMIT_BYTES {
        return Err(ApiError::UploadTooLarge("icon exceeds the 2 MB limit".into()));
    }

    let extension = match content_type.as_str() {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "img",
    };
    let filename = format!("{}.{}", role.id, extension);
    tokio::fs::create_dir_all(&state.config.role_icons_dir)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    tokio::fs::write(state.config.role_icons_dir.join(&filename), &bytes)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let icon_url = format!("/role-icons/{filename}");
    state.store.set_role_icon(&role.id, Some(&icon_url))?;
    state.audit("role_icon", Some(&user.id), Some(&role.id), serde_json::json!({}));

    state
        .store
        .get_role(&role.id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("role".into()))
}

/// Resolve the role and verify the actor sits above it in the hierarchy.
fn require_role_authority(state: &AppState, user_id: &str, role_id: &str) -> ApiResult<RoleRecord> {
    let role = state
        .store
        .get_role(role_id)?
        .ok_or_else(|| ApiError::NotFound("role".into()))?;
    let guild_id = role.guild_id.clone();
    let actor = state
        .store
        .get_member(&guild_id, user_id)?
        .ok_or_else(|| ApiError::Forbidden("not a member".into()))?;
    let roles = state.store.list_roles(&guild_id)?;
    if permissions::can_manage_role(&actor, &role, &guild_id, &roles) {
        Ok(role)
    } else {
        Err(ApiError::Forbidden("role outranks you".into()))
    }
}
