//! Channel message history: append-only rows, cursor pagination, edits,
//! hard deletes with attachment cascade.

use rusqlite::{params, OptionalExtension, Result as SqlResult};
use serde::{Deserialize, Serialize};

use super::{now_ms, Db};

pub const DEFAULT_PAGE: usize = 50;
pub const MAX_PAGE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub kind: String,
    pub edited_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRow {
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub size: i64,
    pub mime: String,
    pub sha256: String,
    pub storage_path: String,
}

impl Db {
    pub fn insert_message(&self, message: &MessageRow) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO messages (id, channel_id, author_id, content, kind, edited_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.channel_id,
                message.author_id,
                message.content,
                message.kind,
                message.edited_at,
                message.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> SqlResult<Option<MessageRow>> {
        self.conn()
            .query_row(
                "SELECT id, channel_id, author_id, content, kind, edited_at, created_at
                 FROM messages WHERE id = ?1",
                params![id],
                map_message_row,
            )
            .optional()
    }

    /// Page through a channel's history, most recent first.
    ///
    /// `before` and `after` are message-id cursors; both bounds are
    /// exclusive and at most one may be set (the caller validates). The
    /// limit clamps to (0, 100], defaulting to 50.
    pub fn get_messages(
        &self,
        channel_id: &str,
        before: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> SqlResult<Vec<MessageRow>> {
        let limit = if limit == 0 {
            DEFAULT_PAGE
        } else {
            limit.min(MAX_PAGE)
        };
        let rows = match (before, after) {
            (Some(b), _) => {
                let mut stmt = self.conn().prepare(
                    "SELECT id, channel_id, author_id, content, kind, edited_at, created_at
                     FROM messages
                     WHERE channel_id = ?1 AND id < ?2
                     ORDER BY id DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![channel_id, b, limit as i64], map_message_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
            (None, Some(a)) => {
                let mut stmt = self.conn().prepare(
                    "SELECT id, channel_id, author_id, content, kind, edited_at, created_at
                     FROM messages
                     WHERE channel_id = ?1 AND id > ?2
                     ORDER BY id DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![channel_id, a, limit as i64], map_message_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
            (None, None) => {
                let mut stmt = self.conn().prepare(
                    "SELECT id, channel_id, author_id, content, kind, edited_at, created_at
                     FROM messages
                     WHERE channel_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![channel_id, limit as i64], map_message_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    /// Overwrite content and stamp `edited_at`. The author column never
    /// changes. Returns the number of rows touched.
    pub fn edit_message(&self, id: &str, content: &str) -> SqlResult<usize> {
        self.conn().execute(
            "UPDATE messages SET content = ?2, edited_at = ?3 WHERE id = ?1",
            params![id, content, now_ms()],
        )
    }

    /// Hard delete; attachments cascade with the row.
    pub fn delete_message(&self, id: &str) -> SqlResult<usize> {
        self.conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id])
    }

    pub fn add_attachment(&self, attachment: &AttachmentRow) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO attachments (id, message_id, filename, size, mime, sha256, storage_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                attachment.id,
                attachment.message_id,
                attachment.filename,
                attachment.size,
                attachment.mime,
                attachment.sha256,
                attachment.storage_path,
            ],
        )?;
        Ok(())
    }

    pub fn list_attachments(&self, message_id: &str) -> SqlResult<Vec<AttachmentRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, message_id, filename, size, mime, sha256, storage_path
             FROM attachments WHERE message_id = ?1",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(AttachmentRow {
                id: row.get(0)?,
                message_id: row.get(1)?,
                filename: row.get(2)?,
                size: row.get(3)?,
                mime: row.get(4)?,
                sha256: row.get(5)?,
                storage_path: row.get(6)?,
            })
        })?;
        rows.collect()
    }
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        author_id: row.get(2)?,
        content: row.get(3)?,
        kind: row.get(4)?,
        edited_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}
