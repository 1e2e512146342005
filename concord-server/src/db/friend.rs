//! Friend requests, friendships, blocks, and the direct-message pair log.
//!
//! Friendship is symmetric and stored as two rows, one per direction, so
//! "friends of X" is a single indexed scan. Conversations are readable by
//! either pair ordering; the two covering indexes on `friend_messages`
//! serve both.

use rusqlite::{params, OptionalExtension, Result as SqlResult};
use serde::{Deserialize, Serialize};

use super::{now_ms, Db, UserRow};

pub const FRIEND_PAGE_DEFAULT: usize = 50;
pub const FRIEND_PAGE_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendStatus {
    Pending,
    Accepted,
    Rejected,
    Blocked,
}

impl FriendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Blocked => "blocked",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "accepted" => Self::Accepted,
            "rejected" => Self::Rejected,
            "blocked" => Self::Blocked,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequestRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub status: FriendStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendMessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: i64,
}

impl Db {
    // ── Requests ───────────────────────────────────────────────────────

    pub fn create_friend_request(
        &self,
        id: &str,
        sender_id: &str,
        receiver_id: &str,
    ) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO friend_requests (id, sender_id, receiver_id, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![id, sender_id, receiver_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_friend_request(&self, id: &str) -> SqlResult<Option<FriendRequestRow>> {
        self.conn()
            .query_row(
                "SELECT id, sender_id, receiver_id, status, created_at
                 FROM friend_requests WHERE id = ?1",
                params![id],
                map_request_row,
            )
            .optional()
    }

    /// Any request row between the two users, in either direction.
    pub fn get_friend_request_between(
        &self,
        a: &str,
        b: &str,
    ) -> SqlResult<Option<FriendRequestRow>> {
        self.conn()
            .query_row(
                "SELECT id, sender_id, receiver_id, status, created_at
                 FROM friend_requests
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 LIMIT 1",
                params![a, b],
                map_request_row,
            )
            .optional()
    }

    /// Incoming pending requests for a user.
    pub fn list_pending_requests(&self, receiver_id: &str) -> SqlResult<Vec<FriendRequestRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, sender_id, receiver_id, status, created_at
             FROM friend_requests
             WHERE receiver_id = ?1 AND status = 'pending'
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![receiver_id], map_request_row)?;
        rows.collect()
    }

    pub fn update_friend_request_status(
        &self,
        id: &str,
        status: FriendStatus,
    ) -> SqlResult<usize> {
        self.conn().execute(
            "UPDATE friend_requests SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )
    }

    pub fn delete_friend_request(&self, id: &str) -> SqlResult<usize> {
        self.conn()
            .execute("DELETE FROM friend_requests WHERE id = ?1", params![id])
    }

    /// Remove any request rows between the pair (both directions).
    pub fn delete_friend_requests_between(&self, a: &str, b: &str) -> SqlResult<usize> {
        self.conn().execute(
            "DELETE FROM friend_requests
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)",
            params![a, b],
        )
    }

    // ── Friendships ────────────────────────────────────────────────────

    /// Record a symmetric friendship as two rows in one transaction.
    pub fn add_friendship(&self, a: &str, b: &str) -> SqlResult<()> {
        let tx = self.conn().unchecked_transaction()?;
        let ts = now_ms();
        tx.execute(
            "INSERT OR IGNORE INTO friendships (user_id, friend_id, created_at) VALUES (?1, ?2, ?3)",
            params![a, b, ts],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO friendships (user_id, friend_id, created_at) VALUES (?1, ?2, ?3)",
            params![b, a, ts],
        )?;
        tx.commit()
    }

    pub fn remove_friendship(&self, a: &str, b: &str) -> SqlResult<usize> {
        self.conn().execute(
            "DELETE FROM friendships
             WHERE (user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1)",
            params![a, b],
        )
    }

    pub fn are_friends(&self, a: &str, b: &str) -> SqlResult<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM friendships WHERE user_id = ?1 AND friend_id = ?2",
                params![a, b],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_friends(&self, user_id: &str) -> SqlResult<Vec<UserRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT u.id, u.external_id, u.handle, u.display_name, u.avatar_url,
                    u.created_at, u.updated_at
             FROM friendships f
             JOIN users u ON u.id = f.friend_id
             WHERE f.user_id = ?1
             ORDER BY u.handle",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                external_id: row.get(1)?,
                handle: row.get(2)?,
                display_name: row.get(3)?,
                avatar_url: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;
        rows.collect()
    }

    // ── Direct messages ────────────────────────────────────────────────

    pub fn insert_friend_message(&self, message: &FriendMessageRow) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO friend_messages (id, sender_id, receiver_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.sender_id,
                message.receiver_id,
                message.content,
                message.created_at,
            ],
        )?;
        Ok(())
    }

    /// A conversation page, oldest first, starting after the cursor.
    /// The limit clamps to (0, 200].
    pub fn list_friend_messages(
        &self,
        a: &str,
        b: &str,
        after: Option<&str>,
        limit: usize,
    ) -> SqlResult<Vec<FriendMessageRow>> {
        let limit = if limit == 0 {
            FRIEND_PAGE_DEFAULT
        } else {
            limit.min(FRIEND_PAGE_MAX)
        };
        let cursor = after.unwrap_or("");
        let mut stmt = self.conn().prepare(
            "SELECT id, sender_id, receiver_id, content, created_at
             FROM friend_messages
             WHERE ((sender_id = ?1 AND receiver_id = ?2)
                 OR (sender_id = ?2 AND receiver_id = ?1))
               AND id > ?3
             ORDER BY id
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![a, b, cursor, limit as i64], |row| {
            Ok(FriendMessageRow {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                receiver_id: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        rows.collect()
    }
}

fn map_request_row(row: &rusqlite::Row) -> SqlResult<FriendRequestRow> {
    let status: String = row.get(3)?;
    Ok(FriendRequestRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        status: FriendStatus::from_str(&status),
        created_at: row.get(4)?,
    })
}
