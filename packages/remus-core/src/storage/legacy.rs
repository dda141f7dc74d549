//! Legacy JSON export handling.
//!
//! Early deployments persisted everything as a single JSON document at the
//! database path. On bring-up, if the store file turns out to be such a
//! document, it is copied aside and imported once into the fresh database
//! (guarded by "all tables are empty").

use serde::Deserialize;

use crate::models::{
    AttachmentRef, BanRecord, ChannelKind, GuildRecord, MemberRecord, PermissionOverrides,
    ProfileRecord, RoleRecord, Settings, UploadRecord,
};
use crate::permissions::Permissions;

/// The legacy export document. Every key is optional, so partial exports
/// import whatever they carry.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyExport {
    #[serde(default)]
    pub profiles: Vec<ProfileRecord>,
    #[serde(default)]
    pub guilds: Vec<GuildRecord>,
    #[serde(default)]
    pub roles: Vec<LegacyRole>,
    #[serde(default)]
    pub members: Vec<MemberRecord>,
    #[serde(default)]
    pub channels: Vec<LegacyChannel>,
    #[serde(default)]
    pub messages: Vec<LegacyMessage>,
    #[serde(default)]
    pub uploads: Vec<UploadRecord>,
    #[serde(default)]
    pub bans: Vec<BanRecord>,
    #[serde(default)]
    pub audit: Vec<LegacyAudit>,
    #[serde(default)]
    pub settings: Option<Settings>,
}

/// Legacy role rows sometimes miss position/hoist.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRole {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

impl LegacyRole {
    pub fn into_record(self) -> RoleRecord {
        RoleRecord {
            id: self.id,
            guild_id: self.guild_id,
            name: self.name,
            color: self.color,
            permissions: self.permissions,
            hoist: self.hoist,
            position: self.position,
            icon_url: self.icon_url,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyChannel {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, rename = "permissionOverrides")]
    pub overrides: PermissionOverrides,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMessage {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAudit {
    pub guild_id: String,
    pub action: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub created_at: i64,
}

/// SQLite files start with this magic; anything else at the store path is
/// either empty, a legacy JSON export, or corrupt.
pub const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

/// Does the byte content look like a JSON document?
pub fn looks_like_json(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{' || *b == b'[')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_json() {
        assert!(looks_like_json(b"  {\"profiles\": []}"));
        assert!(looks_like_json(b"\n[1, 2]"));
        assert!(!looks_like_json(b"SQLite format 3\0"));
        assert!(!looks_like_json(b""));
        assert!(!looks_like_json(b"   "));
    }

    #[test]
    fn test_partial_export_parses() {
        let doc = r#"{
            "guilds": [{"id": "g1", "name": "Home", "createdAt": 1}],
            "roles": [{"id": "g1", "guildId": "g1", "name": "@everyone", "permissions": "70"}],
            "members": [{"guildId": "g1", "userId": "u1", "joinedAt": 5}]
        }"#;
        let export: LegacyExport = serde_json::from_str(doc).unwrap();
        assert_eq!(export.guilds.len(), 1);
        assert_eq!(export.roles[0].permissions.bits(), 70);
        assert!(export.messages.is_empty());
        assert!(export.settings.is_none());
    }
}
