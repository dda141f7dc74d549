//! Moderation and lifecycle: kick/ban with cascade purge, best-effort
//! file cleanup, and the heartbeat to the external authority.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use remus_core::{AttachmentRef, Store, UploadRecord};

use crate::config::NodeConfig;
use crate::error::ApiResult;
use crate::gateway::protocol::ServerEvent;
use crate::gateway::rooms::RoomKey;
use crate::state::AppState;

// ── File cleanup ─────────────────────────────────────────────────────────

/// Remove upload files from disk. Missing files are ignored; rows are
/// the source of truth and files may already be gone.
pub fn delete_upload_files(config: &NodeConfig, uploads: &[UploadRecord]) {
    for upload in uploads {
        delete_by_url(&config.uploads_dir, &upload.url);
    }
}

pub fn delete_attachment_files(config: &NodeConfig, attachments: &[AttachmentRef]) {
    for attachment in attachments {
        delete_by_url(&config.uploads_dir, &attachment.url);
    }
}

fn delete_by_url(uploads_dir: &Path, url: &str) {
    let Some(disk_name) = url.strip_prefix("/uploads/") else { return };
    // Stored names never contain separators; refuse anything that does.
    if disk_name.contains('/') || disk_name.contains('\\') || disk_name.contains("..") {
        return;
    }
    let path = uploads_dir.join(disk_name);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "upload file removal failed");
        }
    }
}

// ── Kick / ban ───────────────────────────────────────────────────────────

/// Remove a member: `guild:memberLeft` to the guild, `guild:kicked` to
/// the target, then disconnect their sockets. No purge.
pub async fn kick_user(
    state: &AppState,
    actor_id: &str,
    guild_id: &str,
    user_id: &str,
) -> ApiResult<()> {
    for session_id in state.rooms.sessions_of_user(user_id) {
        state.voice.cleanup(&session_id).await;
    }
    state.store.remove_member(guild_id, user_id)?;

    state.rooms.broadcast(
        &RoomKey::Guild(guild_id.to_string()),
        ServerEvent::GuildMemberLeft {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
        },
    );
    state.rooms.disconnect_user(
        user_id,
        Some(ServerEvent::GuildKicked {
            guild_id: guild_id.to_string(),
            reason: "kicked".to_string(),
        }),
    );
    state.audit("member_kick", Some(actor_id), Some(user_id), serde_json::json!({}));
    tracing::info!(user = user_id, actor = actor_id, "member kicked");
    Ok(())
}

/// Ban: persist the ban, purge everything the user owns on this node,
/// fan out the departure, then disconnect them.
pub async fn ban_user(
    state: &AppState,
    actor_id: &str,
    guild_id: &str,
    user_id: &str,
    reason: Option<&str>,
) -> ApiResult<()> {
    for session_id in state.rooms.sessions_of_user(user_id) {
        state.voice.cleanup(&session_id).await;
    }

    state.store.add_ban(user_id, reason)?;
    let uploads = state.store.purge_user(user_id)?;
    delete_upload_files(&state.config, &uploads);

    state.rooms.broadcast(
        &RoomKey::Guild(guild_id.to_string()),
        ServerEvent::GuildMemberLeft {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
        },
    );
    state.rooms.disconnect_user(
        user_id,
        Some(ServerEvent::GuildKicked {
            guild_id: guild_id.to_string(),
            reason: "banned".to_string(),
        }),
    );
    state.audit(
        "member_ban",
        Some(actor_id),
        Some(user_id),
        serde_json::json!({ "reason": reason }),
    );
    tracing::info!(user = user_id, actor = actor_id, "member banned and purged");
    Ok(())
}

pub fn unban_user(state: &AppState, actor_id: &str, user_id: &str) -> ApiResult<bool> {
    let removed = state.store.remove_ban(user_id)?;
    if removed {
        state.audit("member_unban", Some(actor_id), Some(user_id), serde_json::json!({}));
    }
    Ok(removed)
}

// ── Heartbeat ────────────────────────────────────────────────────────────

/// POST node metadata to the authority. Failures are silent; the node
/// keeps running without a registry.
pub async fn heartbeat_once(client: &reqwest::Client, config: &NodeConfig, store: &Store) {
    let server_id = store
        .node_guild_id()
        .map(|id| id.chars().take(8).collect::<String>())
        .unwrap_or_default();

    let payload = serde_json::json!({
        "name": config.server_name,
        "publicUrl": config.public_url,
        "serverId": server_id,
        "region": config.region,
        "version": env!("CARGO_PKG_VERSION"),
    });

    let url = format!("{}/api/hosts/heartbeat", config.main_backend_url);
    match client
        .post(&url)
        .json(&payload)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            tracing::debug!("heartbeat delivered");
        }
        Ok(response) => {
            tracing::debug!(status = %response.status(), "heartbeat rejected");
        }
        Err(e) => {
            tracing::debug!(error = %e, "heartbeat failed");
        }
    }
}

/// Heartbeat once at startup, then every 30 seconds.
pub fn spawn_heartbeat(config: Arc<NodeConfig>, store: Store) {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        heartbeat_once(&client, &config, &store).await;
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;
            heartbeat_once(&client, &config, &store).await;
        }
    });
}
