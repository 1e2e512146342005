//! SQLite persistence layer.
//!
//! One `Db` owns the connection; callers serialise access through the
//! `parking_lot::Mutex` held by the server state. WAL mode keeps readers
//! alive during writes. The message full-text index is an FTS5
//! external-content table kept in sync by triggers, so inserts, edits, and
//! deletes can't drift from the index.

mod auth;
mod friend;
mod guild;
mod message;
mod search;

pub use auth::{SessionRow, UserRow};
pub use friend::{FriendMessageRow, FriendRequestRow, FriendStatus};
pub use guild::{ChannelRow, InviteRow, MemberRow, ServerRow};
pub use message::{AttachmentRow, MessageRow};
pub use search::SearchResultRow;

use std::path::Path;

use rusqlite::{Connection, Result as SqlResult};
use sha2::{Digest, Sha256};

/// Database handle. The session key encrypts refresh tokens at rest.
pub struct Db {
    conn: Connection,
    session_key: [u8; 32],
}

/// Derive the at-rest session key from the JWT secret.
pub fn session_key_from_secret(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Current wall-clock in unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P, session_key: [u8; 32]) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn, session_key };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory(session_key: [u8; 32]) -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn, session_key };
        db.init()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn session_key(&self) -> &[u8; 32] {
        &self.session_key
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id           TEXT PRIMARY KEY,
                external_id  TEXT NOT NULL UNIQUE,
                handle       TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                avatar_url   TEXT,
                created_at   INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id                 TEXT PRIMARY KEY,
                user_id            TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                refresh_digest     TEXT NOT NULL,
                refresh_ciphertext TEXT NOT NULL,
                expires_at         INTEGER NOT NULL,
                created_at         INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user
                ON sessions(user_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS servers (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                icon_url    TEXT,
                owner_id    TEXT NOT NULL REFERENCES users(id),
                invite_code TEXT UNIQUE,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channels (
                id         TEXT PRIMARY KEY,
                server_id  TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                name       TEXT NOT NULL,
                kind       TEXT NOT NULL CHECK (kind IN ('text', 'voice')),
                position   INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_channels_server
                ON channels(server_id, position);

            CREATE TABLE IF NOT EXISTS memberships (
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                user_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role      TEXT NOT NULL CHECK (role IN ('owner', 'admin', 'moderator', 'member')),
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (server_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS invites (
                code       TEXT PRIMARY KEY,
                server_id  TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                creator_id TEXT NOT NULL,
                max_uses   INTEGER NOT NULL DEFAULT 0,
                uses       INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id         TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                author_id  TEXT NOT NULL,
                content    TEXT NOT NULL,
                kind       TEXT NOT NULL DEFAULT 'text' CHECK (kind IN ('text', 'system', 'file')),
                edited_at  INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_channel
                ON messages(channel_id, id DESC);

            CREATE TABLE IF NOT EXISTS attachments (
                id           TEXT PRIMARY KEY,
                message_id   TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                filename     TEXT NOT NULL,
                size         INTEGER NOT NULL,
                mime         TEXT NOT NULL,
                sha256       TEXT NOT NULL,
                storage_path TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_message
                ON attachments(message_id);

            CREATE TABLE IF NOT EXISTS friend_requests (
                id          TEXT PRIMARY KEY,
                sender_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                receiver_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                status      TEXT NOT NULL DEFAULT 'pending'
                            CHECK (status IN ('pending', 'accepted', 'rejected', 'blocked')),
                created_at  INTEGER NOT NULL,
                UNIQUE (sender_id, receiver_id)
            );

            CREATE TABLE IF NOT EXISTS friendships (
                user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                friend_id  TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, friend_id)
            );

            CREATE TABLE IF NOT EXISTS friend_messages (
                id          TEXT PRIMARY KEY,
                sender_id   TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                content     TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                CHECK (sender_id <> receiver_id)
            );
            CREATE INDEX IF NOT EXISTS idx_friend_messages_sr
                ON friend_messages(sender_id, receiver_id, id);
            CREATE INDEX IF NOT EXISTS idx_friend_messages_rs
                ON friend_messages(receiver_id, sender_id, id);

            CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                content,
                content='messages',
                content_rowid='rowid',
                tokenize='unicode61'
            );

            CREATE TRIGGER IF NOT EXISTS messages_fts_insert
            AFTER INSERT ON messages BEGIN
                INSERT INTO messages_fts(rowid, content)
                VALUES (new.rowid, new.content);
            END;

            CREATE TRIGGER IF NOT EXISTS messages_fts_delete
            AFTER DELETE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, content)
                VALUES ('delete', old.rowid, old.content);
            END;

            CREATE TRIGGER IF NOT EXISTS messages_fts_update
            AFTER UPDATE OF content ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, content)
                VALUES ('delete', old.rowid, old.content);
                INSERT INTO messages_fts(rowid, content)
                VALUES (new.rowid, new.content);
            END;
            ",
        )?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::memory_db;

    #[test]
    fn schema_initialises_twice() {
        // init() runs on open; a second batch over the same tables must be
        // a no-op, not an error.
        let db = memory_db();
        db.init().unwrap();
    }

    #[test]
    fn session_key_derivation_is_stable() {
        let a = super::session_key_from_secret("0123456789abcdef0123456789abcdef");
        let b = super::session_key_from_secret("0123456789abcdef0123456789abcdef");
        assert_eq!(a, b);
        let c = super::session_key_from_secret("another-secret-another-secret-xx");
        assert_ne!(a, c);
    }
}
