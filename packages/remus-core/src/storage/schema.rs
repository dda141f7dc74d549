//! SQL schema and migrations.
//!
//! Tables are created with `CREATE TABLE IF NOT EXISTS`; columns that were
//! added after the first release (`channels.position`,
//! `messages.reply_to_id`, member voice/timeout state, `roles.icon_url`)
//! are added idempotently via `PRAGMA table_info` probes so an old database
//! upgrades in place.

use rusqlite::{params, Connection};

use crate::error::Result;

/// Base tables and indices.
pub const CREATE_TABLES: &str = r#"
-- Node-level key/value meta: node-guild pointer, settings, import marker
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Profiles mirrored from the external authority
CREATE TABLE IF NOT EXISTS profiles (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    email TEXT,
    created_at INTEGER NOT NULL,
    last_seen_at INTEGER
);

-- Exactly one guild per node
CREATE TABLE IF NOT EXISTS guilds (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS roles (
    id TEXT PRIMARY KEY,
    guild_id TEXT NOT NULL REFERENCES guilds(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    color TEXT,
    -- permission bitmask as decimal text (u64-safe)
    permissions TEXT NOT NULL DEFAULT '0',
    hoist INTEGER NOT NULL DEFAULT 0,
    position INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_roles_guild ON roles(guild_id);

CREATE TABLE IF NOT EXISTS members (
    guild_id TEXT NOT NULL REFERENCES guilds(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    nickname TEXT,
    -- JSON array of role ids
    role_ids TEXT NOT NULL DEFAULT '[]',
    joined_at INTEGER NOT NULL,
    PRIMARY KEY (guild_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_members_user ON members(user_id);

CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    guild_id TEXT NOT NULL REFERENCES guilds(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    category_id TEXT,
    created_by TEXT,
    created_at INTEGER NOT NULL,
    -- JSON: {"roles": {...}, "members": {...}}
    permission_overrides TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_channels_guild ON channels(guild_id);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    author_id TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    -- JSON array of attachment refs
    attachments TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_author ON messages(author_id);

CREATE TABLE IF NOT EXISTS uploads (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    author_id TEXT NOT NULL,
    name TEXT NOT NULL,
    size INTEGER NOT NULL,
    mime_type TEXT NOT NULL,
    url TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_uploads_channel ON uploads(channel_id);
CREATE INDEX IF NOT EXISTS idx_uploads_author ON uploads(author_id);

CREATE TABLE IF NOT EXISTS bans (
    user_id TEXT PRIMARY KEY,
    banned_at INTEGER NOT NULL,
    reason TEXT
);

CREATE TABLE IF NOT EXISTS audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guild_id TEXT NOT NULL,
    action TEXT NOT NULL,
    actor_id TEXT,
    target_id TEXT,
    data TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_guild ON audit(guild_id, id);
"#;

/// Check whether a column exists via `PRAGMA table_info`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Add a column if it is missing. SQLite has no `ADD COLUMN IF NOT EXISTS`.
fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    if !column_exists(conn, table, column)? {
        tracing::info!(table, column, "adding late column");
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}

/// Run all idempotent migrations against an open connection.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES)?;

    ensure_column(conn, "channels", "position", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(conn, "messages", "reply_to_id", "TEXT")?;
    ensure_column(conn, "members", "timeout_until", "INTEGER")?;
    ensure_column(conn, "members", "voice_muted", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(conn, "members", "voice_deafened", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(conn, "roles", "icon_url", "TEXT")?;

    Ok(())
}

/// Assign sequential positions per `(guild_id, category_id)` group in
/// `created_at` order, for rows that predate the position column.
///
/// Only runs when every position in a group is still the column default,
/// so it never fights user-ordered rows.
pub fn backfill_channel_positions(conn: &Connection) -> Result<()> {
    let groups: Vec<(String, Option<String>)> = {
        let mut stmt = conn.prepare(
            "SELECT guild_id, category_id FROM channels
             GROUP BY guild_id, category_id
             HAVING COUNT(*) > 1 AND MAX(position) = 0",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    for (guild_id, category_id) in groups {
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM channels
                 WHERE guild_id = ?1 AND (category_id IS ?2)
                 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(params![guild_id, category_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for (position, id) in ids.iter().enumerate() {
            conn.execute(
                "UPDATE channels SET position = ?1 WHERE id = ?2",
                params![position as i64, id],
            )?;
        }
        tracing::debug!(guild = %guild_id, channels = ids.len(), "backfilled channel positions");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        assert!(column_exists(&conn, "channels", "position").unwrap());
        assert!(column_exists(&conn, "messages", "reply_to_id").unwrap());
        assert!(column_exists(&conn, "members", "timeout_until").unwrap());
        assert!(column_exists(&conn, "roles", "icon_url").unwrap());
    }

    #[test]
    fn test_late_columns_added_to_old_schema() {
        let conn = Connection::open_in_memory().unwrap();
        // A pre-position channels table.
        conn.execute_batch(
            "CREATE TABLE channels (
                id TEXT PRIMARY KEY,
                guild_id TEXT NOT NULL,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                category_id TEXT,
                created_by TEXT,
                created_at INTEGER NOT NULL,
                permission_overrides TEXT NOT NULL DEFAULT '{}'
            );",
        )
        .unwrap();
        assert!(!column_exists(&conn, "channels", "position").unwrap());

        run_migrations(&conn).unwrap();
        assert!(column_exists(&conn, "channels", "position").unwrap());
    }

    #[test]
    fn test_backfill_orders_by_created_at() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO guilds (id, name, created_at) VALUES ('g1', 'g', 0)",
            [],
        )
        .unwrap();
        for (id, created) in [("c-late", 300), ("c-early", 100), ("c-mid", 200)] {
            conn.execute(
                "INSERT INTO channels (id, guild_id, name, type, created_at) VALUES (?1, 'g1', ?1, 'text', ?2)",
                params![id, created],
            )
            .unwrap();
        }

        backfill_channel_positions(&conn).unwrap();

        let pos: i64 = conn
            .query_row("SELECT position FROM channels WHERE id = 'c-early'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pos, 0);
        let pos: i64 = conn
            .query_row("SELECT position FROM channels WHERE id = 'c-late'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pos, 2);
    }
}
