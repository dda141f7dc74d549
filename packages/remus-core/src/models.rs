//! Entity records owned by the store.
//!
//! These structs double as the JSON shapes for stored columns (overrides,
//! attachments, role-id sets) and the legacy export, so everything is
//! camelCase on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::permissions::Permissions;

/// A user profile mirrored from the external authority.
/// Created on first authenticated touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<i64>,
}

/// The single guild hosted by this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildRecord {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRecord {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub permissions: Permissions,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    pub created_at: i64,
}

impl RoleRecord {
    /// `@everyone` carries the guild's id.
    pub fn is_everyone(&self) -> bool {
        self.id == self.guild_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    pub guild_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub role_ids: Vec<String>,
    pub joined_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_until: Option<i64>,
    #[serde(default)]
    pub voice_muted: bool,
    #[serde(default)]
    pub voice_deafened: bool,
}

impl MemberRecord {
    /// Role ids with the implicit `@everyone` (== guild id) included.
    pub fn effective_role_ids(&self, guild_id: &str) -> Vec<String> {
        let mut ids = self.role_ids.clone();
        if !ids.iter().any(|id| id == guild_id) {
            ids.push(guild_id.to_string());
        }
        ids
    }

    pub fn is_timed_out(&self, now_millis: i64) -> bool {
        self.timeout_until.is_some_and(|until| until > now_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Text,
    Voice,
    Category,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Text => "text",
            ChannelKind::Voice => "voice",
            ChannelKind::Category => "category",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ChannelKind::Text),
            "voice" => Some(ChannelKind::Voice),
            "category" => Some(ChannelKind::Category),
            _ => None,
        }
    }
}

/// One allow/deny pair inside a channel's override set.
/// For each bit, allow and deny are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideEntry {
    #[serde(default)]
    pub allow: Permissions,
    #[serde(default)]
    pub deny: Permissions,
}

impl OverrideEntry {
    /// Setting a bit on one side clears it on the other.
    pub fn normalized(allow: Permissions, deny: Permissions) -> Self {
        let deny_bits = deny.bits() & !allow.bits();
        Self {
            allow,
            deny: Permissions::from_bits(deny_bits),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// Per-channel (or per-category) permission overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOverrides {
    #[serde(default)]
    pub roles: BTreeMap<String, OverrideEntry>,
    #[serde(default)]
    pub members: BTreeMap<String, OverrideEntry>,
}

impl PermissionOverrides {
    pub fn set_role(&mut self, role_id: &str, allow: Permissions, deny: Permissions) {
        let entry = OverrideEntry::normalized(allow, deny);
        if entry.is_empty() {
            self.roles.remove(role_id);
        } else {
            self.roles.insert(role_id.to_string(), entry);
        }
    }

    pub fn set_member(&mut self, user_id: &str, allow: Permissions, deny: Permissions) {
        let entry = OverrideEntry::normalized(allow, deny);
        if entry.is_empty() {
            self.members.remove(user_id);
        } else {
            self.members.insert(user_id.to_string(), entry);
        }
    }

    /// Drop every override naming `role_id` (role deletion).
    pub fn scrub_role(&mut self, role_id: &str) {
        self.roles.remove(role_id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default)]
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: i64,
    #[serde(default, rename = "permissionOverrides")]
    pub overrides: PermissionOverrides,
}

/// An attachment reference embedded in a message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub url: String,
    pub created_at: i64,
}

impl UploadRecord {
    pub fn attachment_ref(&self) -> AttachmentRef {
        AttachmentRef {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
            url: self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanRecord {
    pub user_id: String,
    pub banned_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: i64,
    pub guild_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: i64,
}

/// Node-wide tunables, stored as a singleton in the meta table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "Settings::default_audit_max")]
    pub audit_max_entries: i64,
    #[serde(default = "Settings::default_timeout_max")]
    pub timeout_max_minutes: i64,
}

impl Settings {
    fn default_audit_max() -> i64 {
        500
    }

    // 28 days
    fn default_timeout_max() -> i64 {
        40_320
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            audit_max_entries: Self::default_audit_max(),
            timeout_max_minutes: Self::default_timeout_max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Permission;

    #[test]
    fn test_effective_role_ids_include_everyone() {
        let m = MemberRecord {
            guild_id: "g1".into(),
            user_id: "u1".into(),
            nickname: None,
            role_ids: vec!["r1".into()],
            joined_at: 0,
            timeout_until: None,
            voice_muted: false,
            voice_deafened: false,
        };
        let ids = m.effective_role_ids("g1");
        assert!(ids.contains(&"g1".to_string()));
        assert!(ids.contains(&"r1".to_string()));

        // Already present, not duplicated.
        let m2 = MemberRecord { role_ids: vec!["g1".into()], ..m };
        assert_eq!(m2.effective_role_ids("g1").len(), 1);
    }

    #[test]
    fn test_override_allow_deny_exclusive() {
        let send = Permissions::from_bits(Permission::SendMessages as u64);
        let entry = OverrideEntry::normalized(send, send);
        assert!(entry.allow.contains(Permission::SendMessages));
        assert!(!entry.deny.contains(Permission::SendMessages));
    }

    #[test]
    fn test_empty_override_entry_removed() {
        let mut overrides = PermissionOverrides::default();
        let send = Permissions::from_bits(Permission::SendMessages as u64);
        overrides.set_role("r1", send, Permissions::NONE);
        assert!(overrides.roles.contains_key("r1"));

        overrides.set_role("r1", Permissions::NONE, Permissions::NONE);
        assert!(!overrides.roles.contains_key("r1"));
    }

    #[test]
    fn test_channel_kind_round_trip() {
        for kind in [ChannelKind::Text, ChannelKind::Voice, ChannelKind::Category] {
            assert_eq!(ChannelKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChannelKind::parse("forum"), None);
    }

    #[test]
    fn test_overrides_json_shape() {
        let mut overrides = PermissionOverrides::default();
        let send = Permissions::from_bits(Permission::SendMessages as u64);
        overrides.set_role("r1", send, Permissions::NONE);
        overrides.set_member("u1", Permissions::NONE, send);

        let json = serde_json::to_string(&overrides).unwrap();
        assert!(json.contains("\"roles\""));
        assert!(json.contains("\"members\""));

        let back: PermissionOverrides = serde_json::from_str(&json).unwrap();
        assert_eq!(back, overrides);
    }
}
