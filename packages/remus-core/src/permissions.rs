//! # Permission Engine
//!
//! Bitfield permissions composed per `(guild, user, channel)`:
//!
//! 1. OR together the permissions of every role the member holds
//!    (`@everyone` is always held).
//! 2. `ADMINISTRATOR` short-circuits to the full mask; overrides and
//!    timeouts do not apply.
//! 3. Apply category overrides, then channel overrides. Within each:
//!    `@everyone` override first, then the union of matching role
//!    overrides, then the member override (highest precedence).
//! 4. An active timeout clears the blocked bits.
//!
//! Role hierarchy (used for moderation gating, not the bitmask) compares
//! the max position of held roles; an actor manages a target only from a
//! strictly higher position, unless they are an administrator.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::{ChannelRecord, MemberRecord, PermissionOverrides, RoleRecord};

/// Individual permission flags. Each is a single bit in a u64 bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Permission {
    /// Full access; bypasses all checks, overrides, and timeouts
    Administrator = 1 << 0,
    /// See channels and their content
    ViewChannels = 1 << 1,
    /// Create, edit, reorder, and delete channels
    ManageChannels = 1 << 2,
    /// Create, edit, delete, and assign roles
    ManageRoles = 1 << 3,
    /// Edit server settings and the `@everyone` role
    ManageServer = 1 << 4,
    /// Read the audit log
    ViewAuditLog = 1 << 5,
    /// Send messages in text channels
    SendMessages = 1 << 6,
    /// Read message history
    ReadHistory = 1 << 7,
    /// Delete other members' messages
    ManageMessages = 1 << 8,
    /// Attach files to messages
    AttachFiles = 1 << 9,
    /// Connect to voice channels
    VoiceConnect = 1 << 10,
    /// Transmit audio in voice channels
    VoiceSpeak = 1 << 11,
    /// Server-mute other members
    VoiceMuteMembers = 1 << 12,
    /// Server-deafen other members
    VoiceDeafenMembers = 1 << 13,
    /// Move members between voice channels
    VoiceMoveMembers = 1 << 14,
    /// Share screen / video
    Screenshare = 1 << 15,
    /// Kick members
    KickMembers = 1 << 16,
    /// Ban members
    BanMembers = 1 << 17,
    /// Timeout members
    TimeoutMembers = 1 << 18,
}

/// A set of permissions represented as a bitfield.
///
/// Serialized as a decimal string so masks survive JSON consumers that
/// truncate large integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(u64);

impl Permissions {
    /// No permissions.
    pub const NONE: Permissions = Permissions(0);

    /// Every defined permission bit. This is the "full mask" an
    /// administrator resolves to.
    pub const ALL: Permissions = Permissions((1 << 19) - 1);

    /// Bits cleared while a member is in timeout.
    pub const TIMEOUT_BLOCKED: Permissions = Permissions(
        Permission::SendMessages as u64
            | Permission::AttachFiles as u64
            | Permission::VoiceSpeak as u64
            | Permission::Screenshare as u64,
    );

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Parse from a decimal string; unparseable input reads as no bits.
    pub fn from_string(s: &str) -> Self {
        Self(s.parse::<u64>().unwrap_or(0))
    }

    pub fn has(&self, perm: Permission) -> bool {
        if self.0 & (Permission::Administrator as u64) != 0 {
            return true;
        }
        self.0 & (perm as u64) != 0
    }

    /// Raw bit test without the administrator bypass.
    pub fn contains(&self, perm: Permission) -> bool {
        self.0 & (perm as u64) != 0
    }

    pub fn add(&mut self, perm: Permission) {
        self.0 |= perm as u64;
    }

    pub fn remove(&mut self, perm: Permission) {
        self.0 &= !(perm as u64);
    }

    pub fn union(&self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Baseline mask granted to `@everyone` on a fresh guild.
    pub fn default_everyone() -> Self {
        let mut p = Permissions::NONE;
        p.add(Permission::ViewChannels);
        p.add(Permission::SendMessages);
        p.add(Permission::ReadHistory);
        p.add(Permission::AttachFiles);
        p.add(Permission::VoiceConnect);
        p.add(Permission::VoiceSpeak);
        p.add(Permission::Screenshare);
        p
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // Accept both string masks and bare numbers (legacy exports use
        // numbers for small masks).
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Str(s) => Permissions::from_string(&s),
            Raw::Num(n) => Permissions(n),
        })
    }
}

// ── Effective permission resolution ──────────────────────────────────────

/// Everything the engine needs to resolve one `(guild, user, channel?)`
/// query. The caller (store-side resolver) fetches the rows; the engine is
/// pure.
pub struct PermissionQuery<'a> {
    pub guild_id: &'a str,
    pub member: Option<&'a MemberRecord>,
    pub roles: &'a [RoleRecord],
    /// The channel being queried, if any.
    pub channel: Option<&'a ChannelRecord>,
    /// The channel's parent category, if it has one.
    pub category: Option<&'a ChannelRecord>,
    pub now_millis: i64,
}

/// Compute the effective permission mask for a query.
pub fn effective_permissions(q: &PermissionQuery) -> Permissions {
    let member = match q.member {
        Some(m) => m,
        None => return Permissions::NONE,
    };

    let role_ids = member.effective_role_ids(q.guild_id);

    let mut perms = 0u64;
    for role in q.roles {
        if role_ids.iter().any(|id| id == &role.id) {
            perms |= role.permissions.bits();
        }
    }

    if perms & (Permission::Administrator as u64) != 0 {
        return Permissions::ALL;
    }

    if let Some(channel) = q.channel {
        if let Some(category) = q.category {
            perms = apply_overrides(perms, &category.overrides, q.guild_id, &role_ids, &member.user_id);
        }
        perms = apply_overrides(perms, &channel.overrides, q.guild_id, &role_ids, &member.user_id);
    }

    if member.timeout_until.is_some_and(|until| until > q.now_millis) {
        perms &= !Permissions::TIMEOUT_BLOCKED.bits();
    }

    Permissions(perms)
}

/// Apply one override set: `@everyone` first, then the union of matching
/// role overrides, then the member override.
fn apply_overrides(
    base: u64,
    overrides: &PermissionOverrides,
    guild_id: &str,
    role_ids: &[String],
    user_id: &str,
) -> u64 {
    let mut perms = base;

    if let Some(everyone) = overrides.roles.get(guild_id) {
        perms = (perms & !everyone.deny.bits()) | everyone.allow.bits();
    }

    let mut allow = 0u64;
    let mut deny = 0u64;
    for (role_id, entry) in &overrides.roles {
        if role_id == guild_id {
            continue;
        }
        if role_ids.iter().any(|id| id == role_id) {
            allow |= entry.allow.bits();
            deny |= entry.deny.bits();
        }
    }
    perms = (perms & !deny) | allow;

    if let Some(entry) = overrides.members.get(user_id) {
        perms = (perms & !entry.deny.bits()) | entry.allow.bits();
    }

    perms
}

// ── Role hierarchy ───────────────────────────────────────────────────────

/// The member's top role position (`@everyone` sits at 0).
pub fn top_position(member: &MemberRecord, guild_id: &str, roles: &[RoleRecord]) -> i64 {
    let role_ids = member.effective_role_ids(guild_id);
    roles
        .iter()
        .filter(|r| role_ids.iter().any(|id| id == &r.id))
        .map(|r| r.position)
        .max()
        .unwrap_or(0)
}

/// OR of the member's role masks, without channel overrides.
/// Used for hierarchy gating where only guild-wide bits matter.
pub fn base_permissions(member: &MemberRecord, guild_id: &str, roles: &[RoleRecord]) -> Permissions {
    let role_ids = member.effective_role_ids(guild_id);
    let mut perms = 0u64;
    for role in roles {
        if role_ids.iter().any(|id| id == &role.id) {
            perms |= role.permissions.bits();
        }
    }
    Permissions(perms)
}

/// May `actor` perform a moderation action against `target`?
///
/// Administrators always may; otherwise the actor's top position must be
/// strictly greater than the target's. Acting on yourself is always
/// allowed (leaving, changing your own nickname).
pub fn can_manage_member(
    actor: &MemberRecord,
    target: &MemberRecord,
    guild_id: &str,
    roles: &[RoleRecord],
) -> bool {
    if actor.user_id == target.user_id {
        return true;
    }
    let actor_perms = base_permissions(actor, guild_id, roles);
    if actor_perms.contains(Permission::Administrator) {
        return true;
    }
    top_position(actor, guild_id, roles) > top_position(target, guild_id, roles)
}

/// May `actor` edit, delete, or assign `role`?
///
/// `@everyone` (id == guild id) requires ADMINISTRATOR or MANAGE_SERVER.
/// Other roles require ADMINISTRATOR or a strictly higher top position.
pub fn can_manage_role(
    actor: &MemberRecord,
    role: &RoleRecord,
    guild_id: &str,
    roles: &[RoleRecord],
) -> bool {
    let actor_perms = base_permissions(actor, guild_id, roles);
    if actor_perms.contains(Permission::Administrator) {
        return true;
    }
    if role.id == guild_id {
        return actor_perms.contains(Permission::ManageServer);
    }
    top_position(actor, guild_id, roles) > role.position
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OverrideEntry;

    fn role(id: &str, guild: &str, position: i64, perms: Permissions) -> RoleRecord {
        RoleRecord {
            id: id.to_string(),
            guild_id: guild.to_string(),
            name: id.to_string(),
            color: None,
            permissions: perms,
            hoist: false,
            position,
            icon_url: None,
            created_at: 0,
        }
    }

    fn member(guild: &str, user: &str, role_ids: &[&str]) -> MemberRecord {
        MemberRecord {
            guild_id: guild.to_string(),
            user_id: user.to_string(),
            nickname: None,
            role_ids: role_ids.iter().map(|s| s.to_string()).collect(),
            joined_at: 0,
            timeout_until: None,
            voice_muted: false,
            voice_deafened: false,
        }
    }

    fn channel(id: &str, guild: &str, overrides: PermissionOverrides) -> ChannelRecord {
        ChannelRecord {
            id: id.to_string(),
            guild_id: guild.to_string(),
            name: id.to_string(),
            kind: crate::models::ChannelKind::Text,
            category_id: None,
            position: 0,
            created_by: None,
            created_at: 0,
            overrides,
        }
    }

    fn bit(p: Permission) -> Permissions {
        Permissions::from_bits(p as u64)
    }

    #[test]
    fn test_no_member_means_no_permissions() {
        let roles = vec![role("g1", "g1", 0, Permissions::default_everyone())];
        let q = PermissionQuery {
            guild_id: "g1",
            member: None,
            roles: &roles,
            channel: None,
            category: None,
            now_millis: 0,
        };
        assert!(effective_permissions(&q).is_empty());
    }

    #[test]
    fn test_everyone_role_is_implicit() {
        let roles = vec![role("g1", "g1", 0, Permissions::default_everyone())];
        // The member row holds no explicit roles; @everyone still applies.
        let m = member("g1", "u1", &[]);
        let q = PermissionQuery {
            guild_id: "g1",
            member: Some(&m),
            roles: &roles,
            channel: None,
            category: None,
            now_millis: 0,
        };
        assert!(effective_permissions(&q).has(Permission::SendMessages));
    }

    #[test]
    fn test_member_override_wins_over_role_deny() {
        // R2 grants SEND_MESSAGES, the channel denies it for R2, a member
        // override allows it back. Member override wins.
        let roles = vec![
            role("g1", "g1", 0, Permissions::NONE),
            role("r1", "g1", 1, Permissions::NONE),
            role("r2", "g1", 2, bit(Permission::SendMessages)),
        ];
        let mut overrides = PermissionOverrides::default();
        overrides.roles.insert(
            "r2".to_string(),
            OverrideEntry { allow: Permissions::NONE, deny: bit(Permission::SendMessages) },
        );
        overrides.members.insert(
            "u1".to_string(),
            OverrideEntry { allow: bit(Permission::SendMessages), deny: Permissions::NONE },
        );
        let c = channel("c1", "g1", overrides);
        let m = member("g1", "u1", &["r2"]);

        let q = PermissionQuery {
            guild_id: "g1",
            member: Some(&m),
            roles: &roles,
            channel: Some(&c),
            category: None,
            now_millis: 0,
        };
        assert!(effective_permissions(&q).contains(Permission::SendMessages));
    }

    #[test]
    fn test_role_deny_without_member_override() {
        let roles = vec![
            role("g1", "g1", 0, Permissions::NONE),
            role("r2", "g1", 2, bit(Permission::SendMessages)),
        ];
        let mut overrides = PermissionOverrides::default();
        overrides.roles.insert(
            "r2".to_string(),
            OverrideEntry { allow: Permissions::NONE, deny: bit(Permission::SendMessages) },
        );
        let c = channel("c1", "g1", overrides);
        let m = member("g1", "u1", &["r2"]);

        let q = PermissionQuery {
            guild_id: "g1",
            member: Some(&m),
            roles: &roles,
            channel: Some(&c),
            category: None,
            now_millis: 0,
        };
        assert!(!effective_permissions(&q).contains(Permission::SendMessages));
    }

    #[test]
    fn test_admin_short_circuits_overrides_and_timeout() {
        // An administrator in timeout still resolves to the full mask.
        let roles = vec![
            role("g1", "g1", 0, Permissions::NONE),
            role("admin", "g1", 5, bit(Permission::Administrator)),
        ];
        let mut overrides = PermissionOverrides::default();
        overrides.roles.insert(
            "g1".to_string(),
            OverrideEntry { allow: Permissions::NONE, deny: Permissions::ALL },
        );
        let c = channel("c1", "g1", overrides);
        let mut m = member("g1", "u1", &["admin"]);
        m.timeout_until = Some(i64::MAX);

        let q = PermissionQuery {
            guild_id: "g1",
            member: Some(&m),
            roles: &roles,
            channel: Some(&c),
            category: None,
            now_millis: 1,
        };
        assert_eq!(effective_permissions(&q), Permissions::ALL);
    }

    #[test]
    fn test_timeout_masks_blocked_bits() {
        let roles = vec![role("g1", "g1", 0, Permissions::default_everyone())];
        let mut m = member("g1", "u1", &[]);
        m.timeout_until = Some(10_000);

        let q = PermissionQuery {
            guild_id: "g1",
            member: Some(&m),
            roles: &roles,
            channel: None,
            category: None,
            now_millis: 5_000,
        };
        let perms = effective_permissions(&q);
        assert!(!perms.contains(Permission::SendMessages));
        assert!(!perms.contains(Permission::AttachFiles));
        assert!(!perms.contains(Permission::VoiceSpeak));
        assert!(!perms.contains(Permission::Screenshare));
        assert!(perms.contains(Permission::ViewChannels));

        // Expired timeout no longer masks.
        let q = PermissionQuery { now_millis: 20_000, ..q };
        assert!(effective_permissions(&q).contains(Permission::SendMessages));
    }

    #[test]
    fn test_category_overrides_apply_before_channel() {
        let roles = vec![role("g1", "g1", 0, Permissions::default_everyone())];

        // Category denies SEND_MESSAGES for @everyone; channel allows it back.
        let mut cat_overrides = PermissionOverrides::default();
        cat_overrides.roles.insert(
            "g1".to_string(),
            OverrideEntry { allow: Permissions::NONE, deny: bit(Permission::SendMessages) },
        );
        let mut chan_overrides = PermissionOverrides::default();
        chan_overrides.roles.insert(
            "g1".to_string(),
            OverrideEntry { allow: bit(Permission::SendMessages), deny: Permissions::NONE },
        );

        let cat = channel("cat", "g1", cat_overrides);
        let c = channel("c1", "g1", chan_overrides);
        let m = member("g1", "u1", &[]);

        let q = PermissionQuery {
            guild_id: "g1",
            member: Some(&m),
            roles: &roles,
            channel: Some(&c),
            category: Some(&cat),
            now_millis: 0,
        };
        assert!(effective_permissions(&q).contains(Permission::SendMessages));

        // Without the channel-level allow the category deny sticks.
        let bare = channel("c2", "g1", PermissionOverrides::default());
        let q = PermissionQuery { channel: Some(&bare), ..q };
        assert!(!effective_permissions(&q).contains(Permission::SendMessages));
    }

    #[test]
    fn test_hierarchy_strictly_greater() {
        let roles = vec![
            role("g1", "g1", 0, Permissions::NONE),
            role("mod", "g1", 3, bit(Permission::KickMembers)),
            role("helper", "g1", 3, Permissions::NONE),
        ];
        let actor = member("g1", "mod1", &["mod"]);
        let peer = member("g1", "helper1", &["helper"]);
        let below = member("g1", "pleb", &[]);

        // Equal top positions: no.
        assert!(!can_manage_member(&actor, &peer, "g1", &roles));
        // Strictly above: yes.
        assert!(can_manage_member(&actor, &below, "g1", &roles));
        // Self: always.
        assert!(can_manage_member(&peer, &peer, "g1", &roles));
    }

    #[test]
    fn test_everyone_role_needs_manage_server() {
        let everyone = role("g1", "g1", 0, Permissions::NONE);
        let roles = vec![
            everyone.clone(),
            role("mgr", "g1", 2, bit(Permission::ManageRoles)),
            role("srv", "g1", 2, bit(Permission::ManageServer)),
        ];
        let with_manage_roles = member("g1", "u1", &["mgr"]);
        let with_manage_server = member("g1", "u2", &["srv"]);

        assert!(!can_manage_role(&with_manage_roles, &everyone, "g1", &roles));
        assert!(can_manage_role(&with_manage_server, &everyone, "g1", &roles));
    }

    #[test]
    fn test_mask_string_round_trip() {
        let p = Permissions::default_everyone();
        let s = p.to_string();
        assert_eq!(Permissions::from_string(&s), p);

        let json = serde_json::to_string(&p).unwrap();
        let back: Permissions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);

        // Numeric form also deserializes.
        let back: Permissions = serde_json::from_str("64").unwrap();
        assert_eq!(back.bits(), 64);
    }

    #[test]
    fn test_full_mask_covers_every_bit() {
        assert!(Permissions::ALL.contains(Permission::TimeoutMembers));
        assert!(Permissions::ALL.contains(Permission::Administrator));
        assert_eq!(Permissions::ALL.bits(), (1 << 19) - 1);
    }
}
