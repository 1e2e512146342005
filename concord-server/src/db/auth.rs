//! Users and refresh sessions.
//!
//! Refresh tokens are stored encrypted at rest (AES-256-GCM under the key
//! derived from the JWT secret). The SHA-256 digest column allows lookup
//! and integrity checks without decrypting.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use rusqlite::{params, OptionalExtension, Result as SqlResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{now_ms, Db};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    pub external_id: String,
    pub handle: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub refresh_digest: String,
    pub refresh_ciphertext: String,
    pub expires_at: i64,
    pub created_at: i64,
}

/// Hex SHA-256 of a refresh token, for the digest column.
pub(crate) fn refresh_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn encrypt_refresh(key: &[u8; 32], token: &str) -> Option<String> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce_bytes: [u8; 12] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ct = cipher.encrypt(nonce, token.as_bytes()).ok()?;
    let mut combined = Vec::with_capacity(12 + ct.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ct);
    Some(base64::engine::general_purpose::STANDARD.encode(combined))
}

fn decrypt_refresh(key: &[u8; 32], stored: &str) -> Option<String> {
    let combined = base64::engine::general_purpose::STANDARD
        .decode(stored)
        .ok()?;
    if combined.len() <= 12 {
        return None;
    }
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&combined[..12]);
    let pt = cipher.decrypt(nonce, &combined[12..]).ok()?;
    String::from_utf8(pt).ok()
}

impl Db {
    /// Insert or update a user, keyed by id.
    pub fn upsert_user(&self, user: &UserRow) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO users (id, external_id, handle, display_name, avatar_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                handle=excluded.handle,
                display_name=excluded.display_name,
                avatar_url=excluded.avatar_url,
                updated_at=excluded.updated_at",
            params![
                user.id,
                user.external_id,
                user.handle,
                user.display_name,
                user.avatar_url,
                user.created_at,
                user.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> SqlResult<Option<UserRow>> {
        self.conn()
            .query_row(
                "SELECT id, external_id, handle, display_name, avatar_url, created_at, updated_at
                 FROM users WHERE id = ?1",
                params![id],
                map_user_row,
            )
            .optional()
    }

    pub fn get_user_by_external_id(&self, external_id: &str) -> SqlResult<Option<UserRow>> {
        self.conn()
            .query_row(
                "SELECT id, external_id, handle, display_name, avatar_url, created_at, updated_at
                 FROM users WHERE external_id = ?1",
                params![external_id],
                map_user_row,
            )
            .optional()
    }

    /// Persist a session. The refresh token is encrypted here; callers pass
    /// the plaintext token exactly once.
    pub fn save_session(
        &self,
        id: &str,
        user_id: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> SqlResult<()> {
        let ciphertext = encrypt_refresh(self.session_key(), refresh_token)
            .ok_or_else(|| rusqlite::Error::InvalidQuery)?;
        self.conn().execute(
            "INSERT INTO sessions (id, user_id, refresh_digest, refresh_ciphertext, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                user_id,
                refresh_digest(refresh_token),
                ciphertext,
                expires_at,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    /// The most recent non-expired session for a user, if any.
    pub fn get_active_session(&self, user_id: &str) -> SqlResult<Option<SessionRow>> {
        self.conn()
            .query_row(
                "SELECT id, user_id, refresh_digest, refresh_ciphertext, expires_at, created_at
                 FROM sessions
                 WHERE user_id = ?1 AND expires_at > ?2
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![user_id, now_ms()],
                map_session_row,
            )
            .optional()
    }

    pub fn get_session_by_digest(&self, digest: &str) -> SqlResult<Option<SessionRow>> {
        self.conn()
            .query_row(
                "SELECT id, user_id, refresh_digest, refresh_ciphertext, expires_at, created_at
                 FROM sessions WHERE refresh_digest = ?1",
                params![digest],
                map_session_row,
            )
            .optional()
    }

    /// Logout: remove every session the user holds.
    pub fn delete_user_sessions(&self, user_id: &str) -> SqlResult<usize> {
        self.conn()
            .execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])
    }

    /// TTL sweep; returns how many rows were reaped.
    pub fn clean_expired_sessions(&self) -> SqlResult<usize> {
        self.conn().execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![now_ms()],
        )
    }

    /// Recover the plaintext refresh token from a stored session, verifying
    /// the digest on the way out. `None` when the ciphertext or digest
    /// doesn't check out.
    pub fn open_session_refresh(&self, session: &SessionRow) -> Option<String> {
        let token = decrypt_refresh(self.session_key(), &session.refresh_ciphertext)?;
        if refresh_digest(&token) != session.refresh_digest {
            return None;
        }
        Some(token)
    }
}

fn map_user_row(row: &rusqlite::Row) -> SqlResult<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        external_id: row.get(1)?,
        handle: row.get(2)?,
        display_name: row.get(3)?,
        avatar_url: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_session_row(row: &rusqlite::Row) -> SqlResult<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        refresh_digest: row.get(2)?,
        refresh_ciphertext: row.get(3)?,
        expires_at: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{memory_db, seed_user};
    use super::*;

    #[test]
    fn upsert_user_insert_and_update() {
        let db = memory_db();
        let mut user = seed_user(&db, "u1", "alice");

        user.display_name = "Alice A.".into();
        user.updated_at += 1;
        db.upsert_user(&user).unwrap();

        let loaded = db.get_user("u1").unwrap().unwrap();
        assert_eq!(loaded.display_name, "Alice A.");
        assert_eq!(loaded.external_id, "ext-u1");
    }

    #[test]
    fn lookup_by_external_id() {
        let db = memory_db();
        seed_user(&db, "u1", "alice");
        let found = db.get_user_by_external_id("ext-u1").unwrap().unwrap();
        assert_eq!(found.id, "u1");
        assert!(db.get_user_by_external_id("ext-nope").unwrap().is_none());
    }

    #[test]
    fn session_roundtrip_encrypts_at_rest() {
        let db = memory_db();
        seed_user(&db, "u1", "alice");
        let token = "refresh-token-plaintext";
        db.save_session("s1", "u1", token, now_ms() + 60_000).unwrap();

        let session = db.get_active_session("u1").unwrap().unwrap();
        assert_eq!(session.id, "s1");
        assert!(
            !session.refresh_ciphertext.contains(token),
            "token must not appear in the stored column"
        );
        assert_eq!(session.refresh_digest, refresh_digest(token));
        assert_eq!(db.open_session_refresh(&session).unwrap(), token);
    }

    #[test]
    fn digest_lookup_without_decryption() {
        let db = memory_db();
        seed_user(&db, "u1", "alice");
        db.save_session("s1", "u1", "tok-a", now_ms() + 60_000).unwrap();

        let found = db
            .get_session_by_digest(&refresh_digest("tok-a"))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "s1");
        assert!(db
            .get_session_by_digest(&refresh_digest("tok-b"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn active_session_is_latest_unexpired() {
        let db = memory_db();
        seed_user(&db, "u1", "alice");
        db.save_session("old", "u1", "tok-old", now_ms() + 60_000).unwrap();
        db.save_session("expired", "u1", "tok-exp", now_ms() - 1).unwrap();
        db.save_session("new", "u1", "tok-new", now_ms() + 120_000).unwrap();

        let active = db.get_active_session("u1").unwrap().unwrap();
        assert_eq!(active.id, "new");
    }

    #[test]
    fn logout_deletes_all_sessions() {
        let db = memory_db();
        seed_user(&db, "u1", "alice");
        db.save_session("a", "u1", "t1", now_ms() + 60_000).unwrap();
        db.save_session("b", "u1", "t2", now_ms() + 60_000).unwrap();

        assert_eq!(db.delete_user_sessions("u1").unwrap(), 2);
        assert!(db.get_active_session("u1").unwrap().is_none());
    }

    #[test]
    fn expired_sweep_counts_rows() {
        let db = memory_db();
        seed_user(&db, "u1", "alice");
        db.save_session("live", "u1", "t1", now_ms() + 60_000).unwrap();
        db.save_session("dead1", "u1", "t2", now_ms() - 10).unwrap();
        db.save_session("dead2", "u1", "t3", now_ms() - 20).unwrap();

        assert_eq!(db.clean_expired_sessions().unwrap(), 2);
        assert!(db.get_active_session("u1").unwrap().is_some());
    }

    #[test]
    fn tampered_ciphertext_fails_open() {
        let db = memory_db();
        seed_user(&db, "u1", "alice");
        db.save_session("s1", "u1", "tok", now_ms() + 60_000).unwrap();
        let mut session = db.get_active_session("u1").unwrap().unwrap();
        session.refresh_ciphertext = base64::engine::general_purpose::STANDARD.encode([0u8; 32]);
        assert!(db.open_session_refresh(&session).is_none());
    }
}
