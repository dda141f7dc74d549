//! The persistence store.
//!
//! A single SQLite connection behind a mutex; every multi-statement
//! mutation (channel reorder, cascade deletion, legacy import, audit
//! eviction, purge) runs in a transaction. Bring-up order:
//!
//! 1. ensure the storage directory exists
//! 2. salvage a non-database file (legacy JSON aside + timestamped backup)
//! 3. open with WAL + foreign keys
//! 4. run idempotent migrations, backfill channel positions
//! 5. one-shot legacy import when tables are empty
//! 6. ensure the node guild, default channels, and default roles

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    AttachmentRef, AuditRecord, BanRecord, ChannelKind, ChannelRecord, GuildRecord, MemberRecord,
    MessageRecord, PermissionOverrides, ProfileRecord, RoleRecord, Settings, UploadRecord,
};
use crate::permissions::Permissions;
use crate::time::now_millis;

use super::legacy::{self, LegacyExport};
use super::schema;

const META_GUILD_ID: &str = "guild_id";
const META_SETTINGS: &str = "settings";
const META_LEGACY_IMPORTED: &str = "legacy_imported_at";

/// Maximum message content length in characters.
pub const MAX_MESSAGE_CONTENT: usize = 2000;

/// One entry of a channel reorder batch.
#[derive(Debug, Clone)]
pub struct ChannelPositionUpdate {
    pub id: String,
    pub position: i64,
    /// `None` leaves the category unchanged; `Some(None)` moves the channel
    /// to the top level; `Some(Some(id))` moves it under a category.
    pub category_id: Option<Option<String>>,
}

/// Patch for a role update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub color: Option<Option<String>>,
    pub permissions: Option<Permissions>,
    pub hoist: Option<bool>,
    pub position: Option<i64>,
}

/// The durable store. Cheap to clone; all clones share one connection.
#[derive(Clone, Debug)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at `path`, running the full bring-up
    /// sequence.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let legacy_path = salvage_non_database_file(path)?;

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.initialize(legacy_path.as_deref())?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.initialize(None)?;
        Ok(store)
    }

    fn initialize(&self, legacy_path: Option<&Path>) -> Result<()> {
        {
            let conn = self.conn.lock();
            schema::run_migrations(&conn)?;
            schema::backfill_channel_positions(&conn)?;
        }

        if let Some(legacy_path) = legacy_path {
            self.maybe_import_legacy(legacy_path)?;
        }

        self.ensure_node_guild()?;
        Ok(())
    }

    /// One-shot legacy import, guarded by "tables are empty".
    fn maybe_import_legacy(&self, legacy_path: &Path) -> Result<()> {
        if !legacy_path.exists() || !self.tables_empty()? {
            return Ok(());
        }

        let raw = fs::read_to_string(legacy_path)?;
        let export: LegacyExport = serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidDatabase(format!("legacy export unreadable: {e}")))?;
        self.import_legacy(export)?;
        tracing::info!(path = %legacy_path.display(), "imported legacy export");
        Ok(())
    }

    /// Import a legacy export in a single transaction, in dependency
    /// order: profiles → guilds → roles → members → channels → messages →
    /// uploads → bans → audit, then settings.
    pub fn import_legacy(&self, export: LegacyExport) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for p in &export.profiles {
            tx.execute(
                "INSERT OR REPLACE INTO profiles (id, username, email, created_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![p.id, p.username, p.email, p.created_at, p.last_seen_at],
            )?;
        }
        for g in &export.guilds {
            tx.execute(
                "INSERT OR REPLACE INTO guilds (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![g.id, g.name, g.created_at],
            )?;
        }
        for role in export.roles {
            let r = role.into_record();
            tx.execute(
                "INSERT OR REPLACE INTO roles (id, guild_id, name, color, permissions, hoist, position, icon_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    r.id,
                    r.guild_id,
                    r.name,
                    r.color,
                    r.permissions.to_string(),
                    r.hoist as i64,
                    r.position,
                    r.icon_url,
                    r.created_at
                ],
            )?;
        }
        for m in &export.members {
            tx.execute(
                "INSERT OR REPLACE INTO members (guild_id, user_id, nickname, role_ids, joined_at, timeout_until, voice_muted, voice_deafened)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    m.guild_id,
                    m.user_id,
                    m.nickname,
                    serde_json::to_string(&m.role_ids)?,
                    m.joined_at,
                    m.timeout_until,
                    m.voice_muted as i64,
                    m.voice_deafened as i64
                ],
            )?;
        }
        for c in &export.channels {
            tx.execute(
                "INSERT OR REPLACE INTO channels (id, guild_id, name, type, category_id, position, created_by, created_at, permission_overrides)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    c.id,
                    c.guild_id,
                    c.name,
                    c.kind.as_str(),
                    c.category_id,
                    c.position,
                    c.created_by,
                    c.created_at,
                    serde_json::to_string(&c.overrides)?
                ],
            )?;
        }
        for m in &export.messages {
            tx.execute(
                "INSERT OR REPLACE INTO messages (id, channel_id, author_id, content, attachments, reply_to_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    m.id,
                    m.channel_id,
                    m.author_id,
                    m.content,
                    serde_json::to_string(&m.attachments)?,
                    m.reply_to_id,
                    m.created_at
                ],
            )?;
        }
        for u in &export.uploads {
            tx.execute(
                "INSERT OR REPLACE INTO uploads (id, channel_id, author_id, name, size, mime_type, url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![u.id, u.channel_id, u.author_id, u.name, u.size, u.mime_type, u.url, u.created_at],
            )?;
        }
        for b in &export.bans {
            tx.execute(
                "INSERT OR REPLACE INTO bans (user_id, banned_at, reason) VALUES (?1, ?2, ?3)",
                params![b.user_id, b.banned_at, b.reason],
            )?;
        }
        for a in &export.audit {
            tx.execute(
                "INSERT INTO audit (guild_id, action, actor_id, target_id, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    a.guild_id,
                    a.action,
                    a.actor_id,
                    a.target_id,
                    serde_json::to_string(&a.data)?,
                    a.created_at
                ],
            )?;
        }
        if let Some(settings) = &export.settings {
            meta_set(&tx, META_SETTINGS, &serde_json::to_string(settings)?)?;
        }
        meta_set(&tx, META_LEGACY_IMPORTED, &now_millis().to_string())?;

        tx.commit()?;
        Ok(())
    }

    /// Are all content tables empty? Used to guard the legacy import.
    pub fn tables_empty(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM guilds)
                  + (SELECT COUNT(*) FROM profiles)
                  + (SELECT COUNT(*) FROM messages)",
            [],
            |row| row.get(0),
        )?;
        Ok(count == 0)
    }

    /// Ensure the node-guild pointer, default channels, and default roles.
    fn ensure_node_guild(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_millis();

        let mut pointed: Option<String> = meta_get(&tx, META_GUILD_ID)?;
        if let Some(id) = &pointed {
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM guilds WHERE id = ?1", params![id], |row| row.get(0))
                .optional()?;
            if exists.is_none() {
                pointed = None;
            }
        }
        let guild_id = match pointed {
            Some(id) => id,
            None => {
                // Prefer an imported guild over creating a new one.
                let existing: Option<String> = tx
                    .query_row("SELECT id FROM guilds ORDER BY created_at LIMIT 1", [], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id = Uuid::new_v4().to_string();
                        tx.execute(
                            "INSERT INTO guilds (id, name, created_at) VALUES (?1, ?2, ?3)",
                            params![id, "Community", now],
                        )?;
                        tx.execute(
                            "INSERT INTO channels (id, guild_id, name, type, position, created_at)
                             VALUES (?1, ?2, 'general', 'text', 0, ?3)",
                            params![Uuid::new_v4().to_string(), id, now],
                        )?;
                        tx.execute(
                            "INSERT INTO channels (id, guild_id, name, type, position, created_at)
                             VALUES (?1, ?2, 'Lounge', 'voice', 1, ?3)",
                            params![Uuid::new_v4().to_string(), id, now],
                        )?;
                        tracing::info!(guild = %id, "created node guild with default channels");
                        id
                    }
                };
                meta_set(&tx, META_GUILD_ID, &id)?;
                id
            }
        };

        // @everyone: id == guild id, baseline mask, position 0.
        let has_everyone: Option<()> = tx
            .query_row("SELECT 1 FROM roles WHERE id = ?1", params![guild_id], |_| Ok(()))
            .optional()?;
        if has_everyone.is_none() {
            tx.execute(
                "INSERT INTO roles (id, guild_id, name, permissions, position, created_at)
                 VALUES (?1, ?1, '@everyone', ?2, 0, ?3)",
                params![guild_id, Permissions::default_everyone().to_string(), now],
            )?;
        }

        // Admin: all permissions, above every other role.
        let has_admin: Option<()> = tx
            .query_row(
                "SELECT 1 FROM roles WHERE guild_id = ?1 AND name = 'Admin'",
                params![guild_id],
                |_| Ok(()),
            )
            .optional()?;
        if has_admin.is_none() {
            let top: i64 = tx.query_row(
                "SELECT COALESCE(MAX(position), 0) FROM roles WHERE guild_id = ?1",
                params![guild_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO roles (id, guild_id, name, permissions, position, created_at)
                 VALUES (?1, ?2, 'Admin', ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    guild_id,
                    Permissions::ALL.to_string(),
                    top + 1,
                    now
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // ── Meta & settings ──────────────────────────────────────────────────

    pub fn node_guild_id(&self) -> Result<String> {
        let conn = self.conn.lock();
        meta_get(&conn, META_GUILD_ID)?.ok_or(Error::NotFound("guild"))
    }

    pub fn get_settings(&self) -> Result<Settings> {
        let conn = self.conn.lock();
        Ok(match meta_get(&conn, META_SETTINGS)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Settings::default(),
        })
    }

    pub fn update_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.conn.lock();
        meta_set(&conn, META_SETTINGS, &serde_json::to_string(settings)?)
    }

    // ── Profiles ─────────────────────────────────────────────────────────

    /// Create the profile on first touch, refresh username/email and
    /// last-seen afterwards.
    pub fn upsert_profile(&self, id: &str, username: &str, email: Option<&str>) -> Result<ProfileRecord> {
        let now = now_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO profiles (id, username, email, created_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 username = excluded.username,
                 email = COALESCE(excluded.email, profiles.email),
                 last_seen_at = excluded.last_seen_at",
            params![id, username, email, now],
        )?;
        conn.query_row(
            "SELECT id, username, email, created_at, last_seen_at FROM profiles WHERE id = ?1",
            params![id],
            profile_from_row,
        )
        .map_err(Into::into)
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<ProfileRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, email, created_at, last_seen_at FROM profiles WHERE id = ?1",
            params![id],
            profile_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_profiles(&self) -> Result<Vec<ProfileRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, username, email, created_at, last_seen_at FROM profiles ORDER BY username",
        )?;
        let rows = stmt.query_map([], profile_from_row)?;
        collect(rows)
    }

    // ── Guilds ───────────────────────────────────────────────────────────

    pub fn get_guild(&self, id: &str) -> Result<Option<GuildRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, created_at FROM guilds WHERE id = ?1",
            params![id],
            |row| {
                Ok(GuildRecord { id: row.get(0)?, name: row.get(1)?, created_at: row.get(2)? })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn node_guild(&self) -> Result<GuildRecord> {
        let id = self.node_guild_id()?;
        self.get_guild(&id)?.ok_or(Error::NotFound("guild"))
    }

    // ── Roles ────────────────────────────────────────────────────────────

    pub fn create_role(
        &self,
        guild_id: &str,
        name: &str,
        color: Option<&str>,
        permissions: Permissions,
        hoist: bool,
    ) -> Result<RoleRecord> {
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let conn = self.conn.lock();
        let position: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM roles WHERE guild_id = ?1",
            params![guild_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO roles (id, guild_id, name, color, permissions, hoist, position, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![id, guild_id, name, color, permissions.to_string(), hoist as i64, position, now],
        )?;
        drop(conn);
        self.get_role(&id)?.ok_or(Error::NotFound("role"))
    }

    pub fn get_role(&self, id: &str) -> Result<Option<RoleRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, guild_id, name, color, permissions, hoist, position, created_at, icon_url
             FROM roles WHERE id = ?1",
            params![id],
            role_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_roles(&self, guild_id: &str) -> Result<Vec<RoleRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, name, color, permissions, hoist, position, created_at, icon_url
             FROM roles WHERE guild_id = ?1 ORDER BY position DESC, created_at",
        )?;
        let rows = stmt.query_map(params![guild_id], role_from_row)?;
        collect(rows)
    }

    pub fn update_role(&self, id: &str, update: RoleUpdate) -> Result<RoleRecord> {
        let role = self.get_role(id)?.ok_or(Error::NotFound("role"))?;
        if role.is_everyone() && update.position.is_some_and(|p| p != 0) {
            return Err(Error::Conflict("@everyone cannot be repositioned".into()));
        }

        let name = update.name.unwrap_or(role.name);
        let color = update.color.unwrap_or(role.color);
        let permissions = update.permissions.unwrap_or(role.permissions);
        let hoist = update.hoist.unwrap_or(role.hoist);
        let position = update.position.unwrap_or(role.position);

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE roles SET name = ?2, color = ?3, permissions = ?4, hoist = ?5, position = ?6
             WHERE id = ?1",
            params![id, name, color, permissions.to_string(), hoist as i64, position],
        )?;
        drop(conn);
        self.get_role(id)?.ok_or(Error::NotFound("role"))
    }

    pub fn set_role_icon(&self, id: &str, icon_url: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE roles SET icon_url = ?2 WHERE id = ?1",
            params![id, icon_url],
        )?;
        if changed == 0 {
            return Err(Error::NotFound("role"));
        }
        Ok(())
    }

    /// Delete a role and scrub its id from every member's role set in the
    /// same guild. `@everyone` cannot be deleted.
    pub fn delete_role(&self, id: &str) -> Result<RoleRecord> {
        let role = self.get_role(id)?.ok_or(Error::NotFound("role"))?;
        if role.is_everyone() {
            return Err(Error::Conflict("the @everyone role cannot be deleted".into()));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let holders: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT user_id, role_ids FROM members WHERE guild_id = ?1 AND role_ids LIKE ?2",
            )?;
            let pattern = format!("%\"{id}\"%");
            let rows = stmt.query_map(params![role.guild_id, pattern], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for (user_id, raw) in holders {
            let mut ids: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
            ids.retain(|r| r != id);
            tx.execute(
                "UPDATE members SET role_ids = ?3 WHERE guild_id = ?1 AND user_id = ?2",
                params![role.guild_id, user_id, serde_json::to_string(&ids)?],
            )?;
        }

        tx.execute("DELETE FROM roles WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(role)
    }

    // ── Members ──────────────────────────────────────────────────────────

    /// Add a member; joining twice returns the existing row.
    pub fn add_member(&self, guild_id: &str, user_id: &str, nickname: Option<&str>) -> Result<MemberRecord> {
        let now = now_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO members (guild_id, user_id, nickname, role_ids, joined_at)
             VALUES (?1, ?2, ?3, '[]', ?4)",
            params![guild_id, user_id, nickname, now],
        )?;
        drop(conn);
        self.get_member(guild_id, user_id)?.ok_or(Error::NotFound("member"))
    }

    pub fn get_member(&self, guild_id: &str, user_id: &str) -> Result<Option<MemberRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT guild_id, user_id, nickname, role_ids, joined_at, timeout_until, voice_muted, voice_deafened
             FROM members WHERE guild_id = ?1 AND user_id = ?2",
            params![guild_id, user_id],
            member_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_members(&self, guild_id: &str) -> Result<Vec<MemberRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT guild_id, user_id, nickname, role_ids, joined_at, timeout_until, voice_muted, voice_deafened
             FROM members WHERE guild_id = ?1 ORDER BY joined_at",
        )?;
        let rows = stmt.query_map(params![guild_id], member_from_row)?;
        collect(rows)
    }

    /// Guilds the user is a member of (zero or one on this node).
    pub fn guilds_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT guild_id FROM members WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        collect(rows)
    }

    pub fn update_member_nickname(&self, guild_id: &str, user_id: &str, nickname: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE members SET nickname = ?3 WHERE guild_id = ?1 AND user_id = ?2",
            params![guild_id, user_id, nickname],
        )?;
        if changed == 0 {
            return Err(Error::NotFound("member"));
        }
        Ok(())
    }

    /// Replace a member's role set. Ids that don't name a role in the
    /// guild are dropped; the implicit `@everyone` id is not stored.
    pub fn update_member_roles(&self, guild_id: &str, user_id: &str, role_ids: &[String]) -> Result<MemberRecord> {
        let valid: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT id FROM roles WHERE guild_id = ?1")?;
            let rows = stmt.query_map(params![guild_id], |row| row.get::<_, String>(0))?;
            let existing: Vec<String> = rows.collect::<std::result::Result<_, _>>()?;
            let mut seen = Vec::new();
            for id in role_ids {
                if id != guild_id && existing.contains(id) && !seen.contains(id) {
                    seen.push(id.clone());
                }
            }
            seen
        };

        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE members SET role_ids = ?3 WHERE guild_id = ?1 AND user_id = ?2",
            params![guild_id, user_id, serde_json::to_string(&valid)?],
        )?;
        if changed == 0 {
            return Err(Error::NotFound("member"));
        }
        drop(conn);
        self.get_member(guild_id, user_id)?.ok_or(Error::NotFound("member"))
    }

    pub fn update_member_timeout(&self, guild_id: &str, user_id: &str, timeout_until: Option<i64>) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE members SET timeout_until = ?3 WHERE guild_id = ?1 AND user_id = ?2",
            params![guild_id, user_id, timeout_until],
        )?;
        if changed == 0 {
            return Err(Error::NotFound("member"));
        }
        Ok(())
    }

    pub fn update_member_voice(
        &self,
        guild_id: &str,
        user_id: &str,
        muted: Option<bool>,
        deafened: Option<bool>,
    ) -> Result<MemberRecord> {
        let member = self.get_member(guild_id, user_id)?.ok_or(Error::NotFound("member"))?;
        let muted = muted.unwrap_or(member.voice_muted);
        let deafened = deafened.unwrap_or(member.voice_deafened);
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE members SET voice_muted = ?3, voice_deafened = ?4 WHERE guild_id = ?1 AND user_id = ?2",
            params![guild_id, user_id, muted as i64, deafened as i64],
        )?;
        drop(conn);
        self.get_member(guild_id, user_id)?.ok_or(Error::NotFound("member"))
    }

    pub fn remove_member(&self, guild_id: &str, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM members WHERE guild_id = ?1 AND user_id = ?2",
            params![guild_id, user_id],
        )?;
        Ok(changed > 0)
    }

    // ── Channels ─────────────────────────────────────────────────────────

    /// Verify that `category_id` names a category channel in `guild_id`.
    fn check_category(conn: &Connection, guild_id: &str, category_id: &str) -> Result<()> {
        let kind: Option<String> = conn
            .query_row(
                "SELECT type FROM channels WHERE id = ?1 AND guild_id = ?2",
                params![category_id, guild_id],
                |row| row.get(0),
            )
            .optional()?;
        match kind.as_deref() {
            Some("category") => Ok(()),
            Some(_) => Err(Error::Conflict("categoryId must reference a category channel".into())),
            None => Err(Error::NotFound("category")),
        }
    }

    pub fn create_channel(
        &self,
        guild_id: &str,
        name: &str,
        kind: ChannelKind,
        category_id: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<ChannelRecord> {
        if kind == ChannelKind::Category && category_id.is_some() {
            return Err(Error::Conflict("categories cannot be nested".into()));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let conn = self.conn.lock();
        if let Some(category_id) = category_id {
            Self::check_category(&conn, guild_id, category_id)?;
        }
        // Append to the tail of the (guild, category) group.
        let position: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM channels WHERE guild_id = ?1 AND category_id IS ?2",
            params![guild_id, category_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO channels (id, guild_id, name, type, category_id, position, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![id, guild_id, name, kind.as_str(), category_id, position, created_by, now],
        )?;
        drop(conn);
        self.get_channel(&id)?.ok_or(Error::NotFound("channel"))
    }

    pub fn get_channel(&self, id: &str) -> Result<Option<ChannelRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, guild_id, name, type, category_id, position, created_by, created_at, permission_overrides
             FROM channels WHERE id = ?1",
            params![id],
            channel_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_channels(&self, guild_id: &str) -> Result<Vec<ChannelRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, name, type, category_id, position, created_by, created_at, permission_overrides
             FROM channels WHERE guild_id = ?1 ORDER BY category_id IS NOT NULL, category_id, position, created_at",
        )?;
        let rows = stmt.query_map(params![guild_id], channel_from_row)?;
        collect(rows)
    }

    pub fn update_channel(
        &self,
        id: &str,
        name: Option<&str>,
        category_id: Option<Option<&str>>,
        overrides: Option<&PermissionOverrides>,
    ) -> Result<ChannelRecord> {
        let channel = self.get_channel(id)?.ok_or(Error::NotFound("channel"))?;

        let conn = self.conn.lock();
        if let Some(Some(category_id)) = category_id {
            if channel.kind == ChannelKind::Category {
                return Err(Error::Conflict("categories cannot be nested".into()));
            }
            Self::check_category(&conn, &channel.guild_id, category_id)?;
        }

        let name = name.unwrap_or(&channel.name);
        let category = match category_id {
            Some(c) => c.map(|s| s.to_string()),
            None => channel.category_id.clone(),
        };
        let overrides_json = match overrides {
            Some(o) => serde_json::to_string(o)?,
            None => serde_json::to_string(&channel.overrides)?,
        };
        conn.execute(
            "UPDATE channels SET name = ?2, category_id = ?3, permission_overrides = ?4 WHERE id = ?1",
            params![id, name, category, overrides_json],
        )?;
        drop(conn);
        self.get_channel(id)?.ok_or(Error::NotFound("channel"))
    }

    /// Apply a reorder batch atomically. Every referenced channel must
    /// belong to `guild_id`; a category target must be a category in the
    /// same guild.
    pub fn update_channel_positions(&self, guild_id: &str, batch: &[ChannelPositionUpdate]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for update in batch {
            let (kind, current_category): (String, Option<String>) = tx
                .query_row(
                    "SELECT type, category_id FROM channels WHERE id = ?1 AND guild_id = ?2",
                    params![update.id, guild_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or(Error::NotFound("channel"))?;

            let category = match &update.category_id {
                Some(Some(target)) => {
                    if kind == "category" {
                        return Err(Error::Conflict("categories cannot be nested".into()));
                    }
                    Self::check_category(&tx, guild_id, target)?;
                    Some(target.clone())
                }
                Some(None) => None,
                None => current_category,
            };

            tx.execute(
                "UPDATE channels SET position = ?2, category_id = ?3 WHERE id = ?1",
                params![update.id, update.position, category],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete a channel, its messages, and its upload rows. Returns the
    /// channel and the removed uploads so the caller can delete files.
    pub fn delete_channel(&self, id: &str) -> Result<(ChannelRecord, Vec<UploadRecord>)> {
        let channel = self.get_channel(id)?.ok_or(Error::NotFound("channel"))?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let uploads: Vec<UploadRecord> = {
            let mut stmt = tx.prepare(
                "SELECT id, channel_id, author_id, name, size, mime_type, url, created_at
                 FROM uploads WHERE channel_id = ?1",
            )?;
            let rows = stmt.query_map(params![id], upload_from_row)?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        tx.execute("DELETE FROM messages WHERE channel_id = ?1", params![id])?;
        tx.execute("DELETE FROM uploads WHERE channel_id = ?1", params![id])?;
        tx.execute("DELETE FROM channels WHERE id = ?1", params![id])?;

        tx.commit()?;
        Ok((channel, uploads))
    }

    // ── Messages ─────────────────────────────────────────────────────────

    pub fn create_message(
        &self,
        channel_id: &str,
        author_id: &str,
        content: &str,
        attachments: Vec<AttachmentRef>,
        reply_to_id: Option<&str>,
    ) -> Result<MessageRecord> {
        if content.chars().count() > MAX_MESSAGE_CONTENT {
            return Err(Error::Conflict(format!(
                "message content exceeds {MAX_MESSAGE_CONTENT} characters"
            )));
        }
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(Error::Conflict("message needs content or attachments".into()));
        }

        let conn = self.conn.lock();
        if let Some(reply_to) = reply_to_id {
            let target_channel: Option<String> = conn
                .query_row(
                    "SELECT channel_id FROM messages WHERE id = ?1",
                    params![reply_to],
                    |row| row.get(0),
                )
                .optional()?;
            match target_channel {
                Some(c) if c == channel_id => {}
                Some(_) => return Err(Error::Conflict("reply target is in another channel".into())),
                None => return Err(Error::NotFound("message")),
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        conn.execute(
            "INSERT INTO messages (id, channel_id, author_id, content, attachments, reply_to_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                channel_id,
                author_id,
                content,
                serde_json::to_string(&attachments)?,
                reply_to_id,
                now
            ],
        )?;
        drop(conn);
        self.get_message(&id)?.ok_or(Error::NotFound("message"))
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, channel_id, author_id, content, attachments, reply_to_id, created_at
             FROM messages WHERE id = ?1",
            params![id],
            message_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// A page of messages, oldest-first. `before` is an exclusive cursor
    /// (a message id); `limit` is clamped to 1..=100.
    pub fn list_messages(&self, channel_id: &str, limit: i64, before: Option<&str>) -> Result<Vec<MessageRecord>> {
        let limit = limit.clamp(1, 100);
        let conn = self.conn.lock();

        let cursor: Option<i64> = match before {
            Some(id) => conn
                .query_row("SELECT created_at FROM messages WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?,
            None => None,
        };

        let mut stmt = conn.prepare(
            "SELECT id, channel_id, author_id, content, attachments, reply_to_id, created_at
             FROM messages
             WHERE channel_id = ?1 AND (?2 IS NULL OR created_at < ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![channel_id, cursor, limit], message_from_row)?;
        let mut page: Vec<MessageRecord> = rows.collect::<std::result::Result<_, _>>()?;
        page.reverse();
        Ok(page)
    }

    /// Delete a message: clear reply pointers to it, remove upload rows
    /// matching its attachments, then the row itself. Returns the removed
    /// message (with attachments) for file cleanup.
    pub fn delete_message(&self, id: &str) -> Result<MessageRecord> {
        let message = self.get_message(id)?.ok_or(Error::NotFound("message"))?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute("UPDATE messages SET reply_to_id = NULL WHERE reply_to_id = ?1", params![id])?;
        for attachment in &message.attachments {
            tx.execute(
                "DELETE FROM uploads WHERE id = ?1 OR url = ?2",
                params![attachment.id, attachment.url],
            )?;
        }
        tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;

        tx.commit()?;
        Ok(message)
    }

    // ── Uploads ──────────────────────────────────────────────────────────

    pub fn create_upload(&self, record: &UploadRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO uploads (id, channel_id, author_id, name, size, mime_type, url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.channel_id,
                record.author_id,
                record.name,
                record.size,
                record.mime_type,
                record.url,
                record.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get_upload(&self, id: &str) -> Result<Option<UploadRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, channel_id, author_id, name, size, mime_type, url, created_at
             FROM uploads WHERE id = ?1",
            params![id],
            upload_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn delete_upload_row(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM uploads WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound("upload"));
        }
        Ok(())
    }

    /// Dereference attachment ids, keeping only uploads owned by the same
    /// `(channel, author)` and deduplicating repeats.
    pub fn resolve_attachments(
        &self,
        channel_id: &str,
        author_id: &str,
        ids: &[String],
    ) -> Result<Vec<UploadRecord>> {
        let mut resolved = Vec::new();
        let mut seen: Vec<&str> = Vec::new();
        for id in ids {
            if seen.contains(&id.as_str()) {
                continue;
            }
            seen.push(id);
            if let Some(upload) = self.get_upload(id)? {
                if upload.channel_id == channel_id && upload.author_id == author_id {
                    resolved.push(upload);
                }
            }
        }
        Ok(resolved)
    }

    // ── Bans ─────────────────────────────────────────────────────────────

    pub fn add_ban(&self, user_id: &str, reason: Option<&str>) -> Result<BanRecord> {
        let now = now_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO bans (user_id, banned_at, reason) VALUES (?1, ?2, ?3)",
            params![user_id, now, reason],
        )?;
        Ok(BanRecord { user_id: user_id.to_string(), banned_at: now, reason: reason.map(Into::into) })
    }

    pub fn remove_ban(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM bans WHERE user_id = ?1", params![user_id])?;
        Ok(changed > 0)
    }

    pub fn is_banned(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let hit: Option<()> = conn
            .query_row("SELECT 1 FROM bans WHERE user_id = ?1", params![user_id], |_| Ok(()))
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn list_bans(&self) -> Result<Vec<BanRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT user_id, banned_at, reason FROM bans ORDER BY banned_at DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok(BanRecord { user_id: row.get(0)?, banned_at: row.get(1)?, reason: row.get(2)? })
        })?;
        collect(rows)
    }

    // ── Audit ────────────────────────────────────────────────────────────

    /// Append an audit entry and evict overflow FIFO down to the
    /// configured cap, in one transaction.
    pub fn add_audit(
        &self,
        guild_id: &str,
        action: &str,
        actor_id: Option<&str>,
        target_id: Option<&str>,
        data: serde_json::Value,
    ) -> Result<()> {
        let max = self.get_settings()?.audit_max_entries.max(1);
        let now = now_millis();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO audit (guild_id, action, actor_id, target_id, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![guild_id, action, actor_id, target_id, serde_json::to_string(&data)?, now],
        )?;
        tx.execute(
            "DELETE FROM audit WHERE guild_id = ?1 AND id NOT IN
                 (SELECT id FROM audit WHERE guild_id = ?1 ORDER BY id DESC LIMIT ?2)",
            params![guild_id, max],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_audit(&self, guild_id: &str, limit: i64, offset: i64) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, action, actor_id, target_id, data, created_at
             FROM audit WHERE guild_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![guild_id, limit.clamp(1, 500), offset.max(0)], |row| {
            let data: String = row.get(5)?;
            Ok(AuditRecord {
                id: row.get(0)?,
                guild_id: row.get(1)?,
                action: row.get(2)?,
                actor_id: row.get(3)?,
                target_id: row.get(4)?,
                data: serde_json::from_str(&data).unwrap_or_default(),
                created_at: row.get(6)?,
            })
        })?;
        collect(rows)
    }

    pub fn audit_count(&self, guild_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM audit WHERE guild_id = ?1", params![guild_id], |row| {
            row.get(0)
        })
        .map_err(Into::into)
    }

    // ── Purge ────────────────────────────────────────────────────────────

    /// Atomically remove a user's member rows, messages, uploads, and
    /// profile. Reply pointers to their messages are cleared. Returns the
    /// removed uploads so the caller can delete files.
    pub fn purge_user(&self, user_id: &str) -> Result<Vec<UploadRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let uploads: Vec<UploadRecord> = {
            let mut stmt = tx.prepare(
                "SELECT id, channel_id, author_id, name, size, mime_type, url, created_at
                 FROM uploads WHERE author_id = ?1",
            )?;
            let rows = stmt.query_map(params![user_id], upload_from_row)?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        tx.execute(
            "UPDATE messages SET reply_to_id = NULL WHERE reply_to_id IN
                 (SELECT id FROM messages WHERE author_id = ?1)",
            params![user_id],
        )?;
        tx.execute("DELETE FROM messages WHERE author_id = ?1", params![user_id])?;
        tx.execute("DELETE FROM uploads WHERE author_id = ?1", params![user_id])?;
        tx.execute("DELETE FROM members WHERE user_id = ?1", params![user_id])?;
        tx.execute("DELETE FROM profiles WHERE id = ?1", params![user_id])?;

        tx.commit()?;
        Ok(uploads)
    }
}

// ── File salvage ─────────────────────────────────────────────────────────

/// If the store file exists but is not a SQLite database: put a JSON body
/// aside as a legacy export and move the original to a timestamped backup.
/// Returns the legacy export path to import from, if any.
fn salvage_non_database_file(path: &Path) -> Result<Option<PathBuf>> {
    let legacy_path = path.with_extension("legacy.json");

    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => {
            // No store file yet; a legacy export from a previous salvage
            // may still be waiting for its one-shot import.
            return Ok(legacy_path.exists().then_some(legacy_path));
        }
    };
    if metadata.len() == 0 {
        return Ok(legacy_path.exists().then_some(legacy_path));
    }

    let mut head = [0u8; 16];
    let mut file = fs::File::open(path)?;
    let read = file.read(&mut head)?;
    drop(file);
    if read >= legacy::SQLITE_MAGIC.len() && &head[..legacy::SQLITE_MAGIC.len()] == legacy::SQLITE_MAGIC {
        return Ok(legacy_path.exists().then_some(legacy_path));
    }

    let contents = fs::read(path)?;
    if !legacy::looks_like_json(&contents) {
        return Err(Error::InvalidDatabase(format!(
            "{} is neither a database nor a legacy export",
            path.display()
        )));
    }

    if !legacy_path.exists() {
        fs::write(&legacy_path, &contents)?;
    }
    let backup = path.with_extension(format!("bak-{}", now_millis()));
    fs::rename(path, &backup)?;
    tracing::warn!(
        backup = %backup.display(),
        export = %legacy_path.display(),
        "store file was a legacy JSON export; moved aside"
    );
    Ok(Some(legacy_path))
}

// ── Row mappers ──────────────────────────────────────────────────────────

fn profile_from_row(row: &Row) -> rusqlite::Result<ProfileRecord> {
    Ok(ProfileRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        created_at: row.get(3)?,
        last_seen_at: row.get(4)?,
    })
}

fn role_from_row(row: &Row) -> rusqlite::Result<RoleRecord> {
    let permissions: String = row.get(4)?;
    Ok(RoleRecord {
        id: row.get(0)?,
        guild_id: row.get(1)?,
        name: row.get(2)?,
        color: row.get(3)?,
        permissions: Permissions::from_string(&permissions),
        hoist: row.get::<_, i64>(5)? != 0,
        position: row.get(6)?,
        created_at: row.get(7)?,
        icon_url: row.get(8)?,
    })
}

fn member_from_row(row: &Row) -> rusqlite::Result<MemberRecord> {
    let role_ids: String = row.get(3)?;
    Ok(MemberRecord {
        guild_id: row.get(0)?,
        user_id: row.get(1)?,
        nickname: row.get(2)?,
        role_ids: serde_json::from_str(&role_ids).unwrap_or_default(),
        joined_at: row.get(4)?,
        timeout_until: row.get(5)?,
        voice_muted: row.get::<_, i64>(6)? != 0,
        voice_deafened: row.get::<_, i64>(7)? != 0,
    })
}

fn channel_from_row(row: &Row) -> rusqlite::Result<ChannelRecord> {
    let kind: String = row.get(3)?;
    let overrides: String = row.get(8)?;
    Ok(ChannelRecord {
        id: row.get(0)?,
        guild_id: row.get(1)?,
        name: row.get(2)?,
        kind: ChannelKind::parse(&kind).unwrap_or(ChannelKind::Text),
        category_id: row.get(4)?,
        position: row.get(5)?,
        created_by: row.get(6)?,
        created_at: row.get(7)?,
        overrides: serde_json::from_str(&overrides).unwrap_or_default(),
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<MessageRecord> {
    let attachments: String = row.get(4)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        author_id: row.get(2)?,
        content: row.get(3)?,
        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
        reply_to_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn upload_from_row(row: &Row) -> rusqlite::Result<UploadRecord> {
    Ok(UploadRecord {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        author_id: row.get(2)?,
        name: row.get(3)?,
        size: row.get(4)?,
        mime_type: row.get(5)?,
        url: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
        .optional()
        .map_err(Into::into)
}

fn meta_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn upload_for(store: &Store, channel: &str, author: &str) -> UploadRecord {
        let record = UploadRecord {
            id: Uuid::new_v4().to_string(),
            channel_id: channel.to_string(),
            author_id: author.to_string(),
            name: "photo.png".to_string(),
            size: 1024,
            mime_type: "image/png".to_string(),
            url: format!("/uploads/{}", Uuid::new_v4()),
            created_at: now_millis(),
        };
        store.create_upload(&record).unwrap();
        record
    }

    #[test]
    fn test_bootstrap_creates_guild_channels_and_roles() {
        let store = store();
        let guild_id = store.node_guild_id().unwrap();
        assert!(store.get_guild(&guild_id).unwrap().is_some());

        let channels = store.list_channels(&guild_id).unwrap();
        let names: Vec<&str> = channels.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"general"));
        assert!(names.contains(&"Lounge"));

        let roles = store.list_roles(&guild_id).unwrap();
        let everyone = roles.iter().find(|r| r.is_everyone()).expect("@everyone");
        assert_eq!(everyone.position, 0);
        let admin = roles.iter().find(|r| r.name == "Admin").expect("Admin");
        assert_eq!(admin.permissions, Permissions::ALL);
        assert!(admin.position > everyone.position);
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("remus.db");

        let guild_id = {
            let store = Store::open(&path).unwrap();
            store.node_guild_id().unwrap()
        };
        let store = Store::open(&path).unwrap();
        assert_eq!(store.node_guild_id().unwrap(), guild_id);
        // No duplicate Admin role.
        let admins = store
            .list_roles(&guild_id)
            .unwrap()
            .into_iter()
            .filter(|r| r.name == "Admin")
            .count();
        assert_eq!(admins, 1);
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remus.db");
        fs::write(&path, b"definitely not a database").unwrap();

        match Store::open(&path) {
            Err(Error::InvalidDatabase(_)) => {}
            other => panic!("expected InvalidDatabase, got {other:?}"),
        }
    }

    #[test]
    fn test_legacy_json_file_is_imported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remus.db");
        fs::write(
            &path,
            r#"{
                "guilds": [{"id": "legacy-guild", "name": "Old Home", "createdAt": 10}],
                "roles": [{"id": "legacy-guild", "guildId": "legacy-guild", "name": "@everyone", "permissions": "2"}],
                "members": [{"guildId": "legacy-guild", "userId": "u1", "joinedAt": 20}],
                "channels": [{"id": "c1", "guildId": "legacy-guild", "name": "imported", "type": "text", "createdAt": 30}],
                "settings": {"auditMaxEntries": 25, "timeoutMaxMinutes": 60}
            }"#,
        )
        .unwrap();

        let store = Store::open(&path).unwrap();
        assert_eq!(store.node_guild_id().unwrap(), "legacy-guild");
        assert_eq!(store.node_guild().unwrap().name, "Old Home");
        assert!(store.get_member("legacy-guild", "u1").unwrap().is_some());
        assert_eq!(store.get_settings().unwrap().audit_max_entries, 25);

        // Original moved to a timestamped backup, export kept aside.
        assert!(path.with_extension("legacy.json").exists());

        // Re-open does not re-import (guard: tables non-empty).
        let store = Store::open(&path).unwrap();
        assert_eq!(store.list_channels("legacy-guild").unwrap().len(), 1);
    }

    #[test]
    fn test_channel_positions_append_per_group() {
        let store = store();
        let g = store.node_guild_id().unwrap();

        let cat = store.create_channel(&g, "Info", ChannelKind::Category, None, None).unwrap();
        let a = store.create_channel(&g, "a", ChannelKind::Text, Some(&cat.id), None).unwrap();
        let b = store.create_channel(&g, "b", ChannelKind::Text, Some(&cat.id), None).unwrap();

        assert_eq!(a.position, 0);
        assert_eq!(b.position, 1);
    }

    #[test]
    fn test_category_validation() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let text = store.create_channel(&g, "t", ChannelKind::Text, None, None).unwrap();

        // A text channel cannot be a parent.
        match store.create_channel(&g, "x", ChannelKind::Text, Some(&text.id), None) {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
        // Categories cannot nest.
        let cat = store.create_channel(&g, "Cat", ChannelKind::Category, None, None).unwrap();
        match store.create_channel(&g, "y", ChannelKind::Category, Some(&cat.id), None) {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_reorder_is_idempotent() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let cat = store.create_channel(&g, "Cat", ChannelKind::Category, None, None).unwrap();
        let a = store.create_channel(&g, "a", ChannelKind::Text, None, None).unwrap();

        let batch = vec![ChannelPositionUpdate {
            id: a.id.clone(),
            position: 5,
            category_id: Some(Some(cat.id.clone())),
        }];
        store.update_channel_positions(&g, &batch).unwrap();
        let first = store.get_channel(&a.id).unwrap().unwrap();

        store.update_channel_positions(&g, &batch).unwrap();
        let second = store.get_channel(&a.id).unwrap().unwrap();

        assert_eq!(first.position, second.position);
        assert_eq!(first.category_id, second.category_id);
        assert_eq!(second.category_id.as_deref(), Some(cat.id.as_str()));
    }

    #[test]
    fn test_delete_channel_cascades_and_returns_uploads() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let c = store.create_channel(&g, "doomed", ChannelKind::Text, None, None).unwrap();

        for _ in 0..3 {
            let u1 = upload_for(&store, &c.id, "author");
            let u2 = upload_for(&store, &c.id, "author");
            store
                .create_message(
                    &c.id,
                    "author",
                    "hello",
                    vec![u1.attachment_ref(), u2.attachment_ref()],
                    None,
                )
                .unwrap();
        }

        let (channel, uploads) = store.delete_channel(&c.id).unwrap();
        assert_eq!(channel.id, c.id);
        assert_eq!(uploads.len(), 6);
        assert!(store.get_channel(&c.id).unwrap().is_none());
        assert!(store.list_messages(&c.id, 50, None).unwrap().is_empty());
        for u in &uploads {
            assert!(store.get_upload(&u.id).unwrap().is_none());
        }
    }

    #[test]
    fn test_delete_message_clears_replies_and_uploads() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let c = store.create_channel(&g, "chat", ChannelKind::Text, None, None).unwrap();

        let upload = upload_for(&store, &c.id, "u1");
        let original = store
            .create_message(&c.id, "u1", "original", vec![upload.attachment_ref()], None)
            .unwrap();
        let reply = store
            .create_message(&c.id, "u2", "a reply", vec![], Some(&original.id))
            .unwrap();

        let removed = store.delete_message(&original.id).unwrap();
        assert_eq!(removed.attachments.len(), 1);
        assert!(store.get_upload(&upload.id).unwrap().is_none());

        // The reply survives with its pointer cleared, not cascaded.
        let reply = store.get_message(&reply.id).unwrap().unwrap();
        assert!(reply.reply_to_id.is_none());
    }

    #[test]
    fn test_reply_target_must_share_channel() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let c1 = store.create_channel(&g, "one", ChannelKind::Text, None, None).unwrap();
        let c2 = store.create_channel(&g, "two", ChannelKind::Text, None, None).unwrap();
        let m = store.create_message(&c1.id, "u1", "hi", vec![], None).unwrap();

        match store.create_message(&c2.id, "u1", "cross", vec![], Some(&m.id)) {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_message_content_limit() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let c = store.create_channel(&g, "chat", ChannelKind::Text, None, None).unwrap();

        let long = "x".repeat(MAX_MESSAGE_CONTENT + 1);
        assert!(store.create_message(&c.id, "u1", &long, vec![], None).is_err());
        assert!(store.create_message(&c.id, "u1", "", vec![], None).is_err());
    }

    #[test]
    fn test_message_pagination() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let c = store.create_channel(&g, "chat", ChannelKind::Text, None, None).unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            // Distinct created_at per row for a stable cursor.
            let id = Uuid::new_v4().to_string();
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO messages (id, channel_id, author_id, content, created_at) VALUES (?1, ?2, 'u', ?3, ?4)",
                params![id, c.id, format!("m{i}"), 1000 + i],
            )
            .unwrap();
            drop(conn);
            ids.push(id);
        }

        let latest = store.list_messages(&c.id, 2, None).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].content, "m3");
        assert_eq!(latest[1].content, "m4");

        let older = store.list_messages(&c.id, 10, Some(&latest[0].id)).unwrap();
        assert_eq!(older.len(), 3);
        assert_eq!(older.last().unwrap().content, "m2");
    }

    #[test]
    fn test_role_delete_scrubs_member_sets() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let role = store.create_role(&g, "Helper", None, Permissions::NONE, false).unwrap();
        store.add_member(&g, "u1", None).unwrap();
        store.update_member_roles(&g, "u1", &[role.id.clone()]).unwrap();

        store.delete_role(&role.id).unwrap();

        let member = store.get_member(&g, "u1").unwrap().unwrap();
        assert!(!member.role_ids.contains(&role.id));

        // Recreating with the same name yields a fresh id; the member set
        // does not resurrect the old one.
        let replacement = store.create_role(&g, "Helper", None, Permissions::NONE, false).unwrap();
        assert_ne!(replacement.id, role.id);
        let member = store.get_member(&g, "u1").unwrap().unwrap();
        assert!(member.role_ids.is_empty());
    }

    #[test]
    fn test_everyone_role_cannot_be_deleted() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        match store.delete_role(&g) {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_member_roles_filter_invalid_ids() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let role = store.create_role(&g, "Real", None, Permissions::NONE, false).unwrap();
        store.add_member(&g, "u1", None).unwrap();

        let member = store
            .update_member_roles(
                &g,
                "u1",
                &[role.id.clone(), "ghost".into(), role.id.clone(), g.clone()],
            )
            .unwrap();
        // Invalid and duplicate ids dropped; implicit @everyone not stored.
        assert_eq!(member.role_ids, vec![role.id]);
    }

    #[test]
    fn test_purge_user_removes_everything() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let c = store.create_channel(&g, "chat", ChannelKind::Text, None, None).unwrap();

        store.upsert_profile("u1", "alice", None).unwrap();
        store.add_member(&g, "u1", None).unwrap();
        let upload = upload_for(&store, &c.id, "u1");
        let msg = store
            .create_message(&c.id, "u1", "mine", vec![upload.attachment_ref()], None)
            .unwrap();
        let reply = store.create_message(&c.id, "u2", "re", vec![], Some(&msg.id)).unwrap();

        let uploads = store.purge_user("u1").unwrap();
        assert_eq!(uploads.len(), 1);
        assert!(store.get_member(&g, "u1").unwrap().is_none());
        assert!(store.get_profile("u1").unwrap().is_none());
        assert!(store.get_message(&msg.id).unwrap().is_none());
        assert!(store.get_upload(&upload.id).unwrap().is_none());
        // Other users' replies survive with cleared pointers.
        assert!(store.get_message(&reply.id).unwrap().unwrap().reply_to_id.is_none());
    }

    #[test]
    fn test_audit_cap_evicts_fifo() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        store
            .update_settings(&Settings { audit_max_entries: 3, ..Settings::default() })
            .unwrap();

        for i in 0..6 {
            store
                .add_audit(&g, &format!("action_{i}"), Some("actor"), None, serde_json::json!({}))
                .unwrap();
            assert!(store.audit_count(&g).unwrap() <= 3);
        }

        let entries = store.list_audit(&g, 10, 0).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].action, "action_5");
        assert_eq!(entries[2].action, "action_3");
    }

    #[test]
    fn test_ban_round_trip() {
        let store = store();
        assert!(!store.is_banned("u1").unwrap());
        store.add_ban("u1", Some("spam")).unwrap();
        assert!(store.is_banned("u1").unwrap());
        assert_eq!(store.list_bans().unwrap().len(), 1);
        assert!(store.remove_ban("u1").unwrap());
        assert!(!store.is_banned("u1").unwrap());
    }

    #[test]
    fn test_resolve_attachments_filters_foreign_uploads() {
        let store = store();
        let g = store.node_guild_id().unwrap();
        let c = store.create_channel(&g, "chat", ChannelKind::Text, None, None).unwrap();

        let mine = upload_for(&store, &c.id, "u1");
        let theirs = upload_for(&store, &c.id, "u2");

        let resolved = store
            .resolve_attachments(&c.id, "u1", &[mine.id.clone(), theirs.id.clone(), mine.id.clone()])
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, mine.id);
    }

    #[test]
    fn test_profile_touch_updates_last_seen() {
        let store = store();
        let first = store.upsert_profile("u1", "alice", None).unwrap();
        let second = store.upsert_profile("u1", "alice2", Some("a@example.com")).unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.username, "alice2");
        assert_eq!(second.email.as_deref(), Some("a@example.com"));
    }
}
