//! File upload ingress.
//!
//! Multipart `{file, channelId}`. Executable and script extensions are
//! refused; names are sanitized before they touch the filesystem and the
//! on-disk name is `<millis>-<uuid>-<sanitized>` so collisions and
//! traversal are structurally impossible.

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde_json::json;
use uuid::Uuid;

use remus_core::{Permission, UploadRecord};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::rate_limit::Limit;
use crate::state::AppState;

/// Blocked file extensions (executables, scripts, native libraries).
const BLOCKED_EXTENSIONS: &[&str] = &[
    ".exe", ".bat", ".cmd", ".com", ".scr", ".vbs", ".js", ".jar", ".msi", ".dll", ".so",
    ".dylib", ".sh", ".ps1",
];

/// Longest allowed sanitized filename.
const MAX_NAME_LEN: usize = 120;

pub async fn upload(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if !state.rate.check("upload", &user.id, Limit::UPLOAD) {
        return Err(ApiError::RateLimited);
    }

    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut channel_id = String::new();

    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name() {
            Some("file") => {
                let name = field.file_name().unwrap_or("file").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(|_| {
                    ApiError::UploadTooLarge(format!(
                        "file exceeds the {} MB limit",
                        state.config.file_limit_mb
                    ))
                })?;
                file = Some((name, content_type, bytes.to_vec()));
            }
            Some("channelId") => {
                if let Ok(text) = field.text().await {
                    channel_id = text;
                }
            }
            _ => {}
        }
    }

    let (original_name, content_type, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("missing file field".into()))?;
    if channel_id.is_empty() {
        return Err(ApiError::BadRequest("missing channelId field".into()));
    }
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("empty file".into()));
    }

    state
        .store
        .get_channel(&channel_id)?
        .ok_or_else(|| ApiError::NotFound("channel".into()))?;
    state.require(&user.id, Permission::AttachFiles, Some(&channel_id))?;

    if is_blocked_extension(&original_name) {
        return Err(ApiError::BadRequest("this file type is not allowed".into()));
    }

    let sanitized = sanitize_filename(&original_name);
    let disk_name = format!(
        "{}-{}-{}",
        remus_core::time::now_millis(),
        Uuid::new_v4(),
        sanitized
    );

    tokio::fs::create_dir_all(&state.config.uploads_dir)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    tokio::fs::write(state.config.uploads_dir.join(&disk_name), &bytes)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let record = UploadRecord {
        id: Uuid::new_v4().to_string(),
        channel_id,
        author_id: user.id.clone(),
        name: sanitized,
        size: bytes.len() as i64,
        mime_type: content_type,
        url: format!("/uploads/{disk_name}"),
        created_at: remus_core::time::now_millis(),
    };
    state.store.create_upload(&record)?;

    tracing::debug!(user = %user.id, upload = %record.id, size = record.size, "file stored");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "attachment": {
                "id": record.id,
                "name": record.name,
                "size": record.size,
                "mimeType": record.mime_type,
                "url": record.url,
            }
        })),
    ))
}

fn is_blocked_extension(name: &str) -> bool {
    let lower = name.to_lowercase();
    BLOCKED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Reduce a client-supplied filename to a safe basename: strip any path,
/// collapse disallowed characters, cap the length (keeping the
/// extension).
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let mut sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim()
        .to_string();
    sanitized = sanitized.trim_start_matches('.').to_string();

    if sanitized.is_empty() {
        sanitized = "file".to_string();
    }
    if sanitized.len() > MAX_NAME_LEN {
        match sanitized.rfind('.') {
            Some(dot) if sanitized.len() - dot <= 16 => {
                let ext = sanitized[dot..].to_string();
                sanitized.truncate(MAX_NAME_LEN - ext.len());
                sanitized.push_str(&ext);
            }
            _ => sanitized.truncate(MAX_NAME_LEN),
        }
    }
    sanitized
}
