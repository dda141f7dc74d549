//! Wire views shared by the HTTP surface and the gateway.
//!
//! Records from the store mostly serialize as-is (they are already
//! camelCase); views exist where the wire shape is richer than the row:
//! messages carry their author and a reply preview, members carry the
//! profile username.

use serde::{Deserialize, Serialize};

use remus_core::{MemberRecord, MessageRecord, ProfileRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorView {
    pub id: String,
    pub username: String,
}

impl AuthorView {
    pub fn from_profile(profile: &ProfileRecord) -> Self {
        Self { id: profile.id.clone(), username: profile.username.clone() }
    }
}

/// A trimmed preview of the message being replied to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub id: String,
    pub author_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<AuthorView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: MessageRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<AuthorView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberView {
    #[serde(flatten)]
    pub member: MemberRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Presence for one voice channel. `user_ids` are peer *session* ids, so
/// one user connected twice appears twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceView {
    pub user_ids: Vec<String>,
    pub users: Vec<PresenceUser>,
    pub speaking_user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub session_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// A producer visible to other peers in a voice room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub peer_id: String,
    pub user_id: String,
    pub kind: String,
    #[serde(default)]
    pub app_data: serde_json::Value,
}

/// A voice-room participant (reply to `voice:join`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub session_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_view_flattens_record() {
        let view = MessageView {
            message: MessageRecord {
                id: "m1".into(),
                channel_id: "c1".into(),
                author_id: "u1".into(),
                content: "hi".into(),
                attachments: vec![],
                reply_to_id: None,
                created_at: 42,
            },
            author: Some(AuthorView { id: "u1".into(), username: "alice".into() }),
            reply_to: None,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "m1");
        assert_eq!(json["channelId"], "c1");
        assert_eq!(json["author"]["username"], "alice");
        assert!(json.get("replyTo").is_none());
    }
}
