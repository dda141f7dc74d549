//! Shared server state and permission query helpers.

use std::sync::Arc;

use remus_core::{
    permissions::{self, PermissionQuery, Permissions},
    MemberRecord, MessageRecord, Permission, Store,
};

use crate::auth::IdentityResolver;
use crate::config::NodeConfig;
use crate::error::{ApiError, ApiResult};
use crate::gateway::rooms::RoomIndex;
use crate::rate_limit::RateLimiter;
use crate::views::{AuthorView, MemberView, MessageView, ReplyPreview};
use crate::voice::VoiceCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<NodeConfig>,
    pub resolver: Arc<IdentityResolver>,
    pub rooms: RoomIndex,
    pub voice: Arc<VoiceCoordinator>,
    pub rate: RateLimiter,
}

/// Effective permissions for `(node guild, user, channel?)`, resolved
/// against the store. Shared by the HTTP pipeline and the voice
/// coordinator's gates.
pub fn query_permissions(
    store: &Store,
    user_id: &str,
    channel_id: Option<&str>,
) -> ApiResult<Permissions> {
    let guild_id = store.node_guild_id()?;
    let member = store.get_member(&guild_id, user_id)?;
    let roles = store.list_roles(&guild_id)?;

    let channel = match channel_id {
        Some(id) => Some(
            store
                .get_channel(id)?
                .ok_or_else(|| ApiError::NotFound("channel".into()))?,
        ),
        None => None,
    };
    let category = match channel.as_ref().and_then(|c| c.category_id.clone()) {
        Some(category_id) => store.get_channel(&category_id)?,
        None => None,
    };

    Ok(permissions::effective_permissions(&PermissionQuery {
        guild_id: &guild_id,
        member: member.as_ref(),
        roles: &roles,
        channel: channel.as_ref(),
        category: category.as_ref(),
        now_millis: remus_core::time::now_millis(),
    }))
}

impl AppState {
    /// Effective permissions for `(node guild, user, channel?)`.
    pub fn permissions(&self, user_id: &str, channel_id: Option<&str>) -> ApiResult<Permissions> {
        query_permissions(&self.store, user_id, channel_id)
    }

    /// Reject with 403 unless the user holds `bit` (in `channel`, if given).
    pub fn require(&self, user_id: &str, bit: Permission, channel_id: Option<&str>) -> ApiResult<()> {
        if self.permissions(user_id, channel_id)?.has(bit) {
            Ok(())
        } else {
            Err(ApiError::forbidden())
        }
    }

    /// Hierarchy gate for moderation against another member.
    pub fn require_outranks(&self, actor_id: &str, target_id: &str) -> ApiResult<()> {
        let guild_id = self.store.node_guild_id()?;
        let actor = self
            .store
            .get_member(&guild_id, actor_id)?
            .ok_or_else(|| ApiError::Forbidden("not a member".into()))?;
        let target = self
            .store
            .get_member(&guild_id, target_id)?
            .ok_or_else(|| ApiError::NotFound("member".into()))?;
        let roles = self.store.list_roles(&guild_id)?;
        if permissions::can_manage_member(&actor, &target, &guild_id, &roles) {
            Ok(())
        } else {
            Err(ApiError::Forbidden("target outranks you".into()))
        }
    }

    /// Append an audit row; storage failures are logged, not surfaced.
    pub fn audit(
        &self,
        action: &str,
        actor_id: Option<&str>,
        target_id: Option<&str>,
        data: serde_json::Value,
    ) {
        let guild_id = match self.store.node_guild_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, "audit append failed: no guild");
                return;
            }
        };
        if let Err(e) = self.store.add_audit(&guild_id, action, actor_id, target_id, data) {
            tracing::error!(action, error = %e, "audit append failed");
        }
    }

    /// Join a message row with its author and reply preview for the wire.
    pub fn message_view(&self, message: MessageRecord) -> MessageView {
        let author = self
            .store
            .get_profile(&message.author_id)
            .ok()
            .flatten()
            .map(|p| AuthorView::from_profile(&p));

        let reply_to = message.reply_to_id.as_ref().and_then(|reply_id| {
            let target = self.store.get_message(reply_id).ok().flatten()?;
            let author = self
                .store
                .get_profile(&target.author_id)
                .ok()
                .flatten()
                .map(|p| AuthorView::from_profile(&p));
            Some(ReplyPreview {
                id: target.id,
                author_id: target.author_id,
                content: target.content,
                author,
            })
        });

        MessageView { message, author, reply_to }
    }

    pub fn member_view(&self, member: MemberRecord) -> MemberView {
        let username = self
            .store
            .get_profile(&member.user_id)
            .ok()
            .flatten()
            .map(|p| p.username);
        MemberView { member, username }
    }
}
