//! Guilds (servers), channels, memberships, and invites.

use rusqlite::{params, OptionalExtension, Result as SqlResult};
use serde::{Deserialize, Serialize};

use super::{now_ms, Db};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRow {
    pub id: String,
    pub name: String,
    pub icon_url: Option<String>,
    pub owner_id: String,
    pub invite_code: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: String,
    pub server_id: String,
    pub name: String,
    pub kind: String,
    pub position: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRow {
    pub server_id: String,
    pub user_id: String,
    pub role: String,
    pub joined_at: i64,
    pub handle: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRow {
    pub code: String,
    pub server_id: String,
    pub creator_id: String,
    pub max_uses: i64,
    pub uses: i64,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

impl Db {
    /// Create a server and its owner membership in one transaction — the
    /// owner is always a member with role `owner`.
    pub fn create_server(&self, server: &ServerRow) -> SqlResult<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO servers (id, name, icon_url, owner_id, invite_code, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                server.id,
                server.name,
                server.icon_url,
                server.owner_id,
                server.invite_code,
                server.created_at,
                server.updated_at,
            ],
        )?;
        tx.execute(
            "INSERT INTO memberships (server_id, user_id, role, joined_at)
             VALUES (?1, ?2, 'owner', ?3)",
            params![server.id, server.owner_id, server.created_at],
        )?;
        tx.commit()
    }

    pub fn get_server(&self, id: &str) -> SqlResult<Option<ServerRow>> {
        self.conn()
            .query_row(
                "SELECT id, name, icon_url, owner_id, invite_code, created_at, updated_at
                 FROM servers WHERE id = ?1",
                params![id],
                map_server_row,
            )
            .optional()
    }

    pub fn update_server(
        &self,
        id: &str,
        name: &str,
        icon_url: Option<&str>,
    ) -> SqlResult<usize> {
        self.conn().execute(
            "UPDATE servers SET name = ?2, icon_url = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, name, icon_url, now_ms()],
        )
    }

    /// Delete a server; channels, memberships, invites, and messages go
    /// with it via the cascade chain.
    pub fn delete_server(&self, id: &str) -> SqlResult<usize> {
        self.conn()
            .execute("DELETE FROM servers WHERE id = ?1", params![id])
    }

    /// Servers the user belongs to, newest first.
    pub fn list_servers_for_user(&self, user_id: &str) -> SqlResult<Vec<ServerRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT s.id, s.name, s.icon_url, s.owner_id, s.invite_code, s.created_at, s.updated_at
             FROM servers s
             JOIN memberships m ON m.server_id = s.id
             WHERE m.user_id = ?1
             ORDER BY s.created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], map_server_row)?;
        rows.collect()
    }

    // ── Channels ───────────────────────────────────────────────────────

    pub fn create_channel(&self, channel: &ChannelRow) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO channels (id, server_id, name, kind, position, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                channel.id,
                channel.server_id,
                channel.name,
                channel.kind,
                channel.position,
                channel.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_channel(&self, id: &str) -> SqlResult<Option<ChannelRow>> {
        self.conn()
            .query_row(
                "SELECT id, server_id, name, kind, position, created_at
                 FROM channels WHERE id = ?1",
                params![id],
                map_channel_row,
            )
            .optional()
    }

    pub fn list_channels(&self, server_id: &str) -> SqlResult<Vec<ChannelRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, server_id, name, kind, position, created_at
             FROM channels WHERE server_id = ?1
             ORDER BY position, created_at",
        )?;
        let rows = stmt.query_map(params![server_id], map_channel_row)?;
        rows.collect()
    }

    pub fn delete_channel(&self, id: &str) -> SqlResult<usize> {
        self.conn()
            .execute("DELETE FROM channels WHERE id = ?1", params![id])
    }

    // ── Memberships ────────────────────────────────────────────────────

    pub fn add_member(&self, server_id: &str, user_id: &str, role: &str) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO memberships (server_id, user_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![server_id, user_id, role, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_member(&self, server_id: &str, user_id: &str) -> SqlResult<Option<MemberRow>> {
        self.conn()
            .query_row(
                "SELECT m.server_id, m.user_id, m.role, m.joined_at,
                        u.handle, u.display_name, u.avatar_url
                 FROM memberships m
                 JOIN users u ON u.id = m.user_id
                 WHERE m.server_id = ?1 AND m.user_id = ?2",
                params![server_id, user_id],
                map_member_row,
            )
            .optional()
    }

    pub fn list_members(&self, server_id: &str) -> SqlResult<Vec<MemberRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT m.server_id, m.user_id, m.role, m.joined_at,
                    u.handle, u.display_name, u.avatar_url
             FROM memberships m
             JOIN users u ON u.id = m.user_id
             WHERE m.server_id = ?1
             ORDER BY m.joined_at",
        )?;
        let rows = stmt.query_map(params![server_id], map_member_row)?;
        rows.collect()
    }

    /// Member user ids only — the fan-out path doesn't need profiles.
    pub fn list_member_ids(&self, server_id: &str) -> SqlResult<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM memberships WHERE server_id = ?1")?;
        let rows = stmt.query_map(params![server_id], |row| row.get(0))?;
        rows.collect()
    }

    pub fn remove_member(&self, server_id: &str, user_id: &str) -> SqlResult<usize> {
        self.conn().execute(
            "DELETE FROM memberships WHERE server_id = ?1 AND user_id = ?2",
            params![server_id, user_id],
        )
    }

    pub fn update_member_role(
        &self,
        server_id: &str,
        user_id: &str,
        role: &str,
    ) -> SqlResult<usize> {
        self.conn().execute(
            "UPDATE memberships SET role = ?3 WHERE server_id = ?1 AND user_id = ?2",
            params![server_id, user_id, role],
        )
    }

    // ── Invites ────────────────────────────────────────────────────────

    pub fn create_invite(&self, invite: &InviteRow) -> SqlResult<()> {
        self.conn().execute(
            "INSERT INTO invites (code, server_id, creator_id, max_uses, uses, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                invite.code,
                invite.server_id,
                invite.creator_id,
                invite.max_uses,
                invite.uses,
                invite.expires_at,
                invite.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_invite(&self, code: &str) -> SqlResult<Option<InviteRow>> {
        self.conn()
            .query_row(
                "SELECT code, server_id, creator_id, max_uses, uses, expires_at, created_at
                 FROM invites WHERE code = ?1",
                params![code],
                map_invite_row,
            )
            .optional()
    }

    pub fn increment_invite_uses(&self, code: &str) -> SqlResult<usize> {
        self.conn().execute(
            "UPDATE invites SET uses = uses + 1 WHERE code = ?1",
            params![code],
        )
    }
}

fn map_server_row(row: &rusqlite::Row) -> SqlResult<ServerRow> {
    Ok(ServerRow {
        id: row.get(0)?,
        name: row.get(1)?,
        icon_url: row.get(2)?,
        owner_id: row.get(3)?,
        invite_code: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_channel_row(row: &rusqlite::Row) -> SqlResult<ChannelRow> {
    Ok(ChannelRow {
        id: row.get(0)?,
        server_id: row.get(1)?,
        name: row.get(2)?,
        kind: row.get(3)?,
        position: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_member_row(row: &rusqlite::Row) -> SqlResult<MemberRow> {
    Ok(MemberRow {
        server_id: row.get(0)?,
        user_id: row.get(1)?,
        role: row.get(2)?,
        joined_at: row.get(3)?,
        handle: row.get(4)?,
        display_name: row.get(5)?,
        avatar_url: row.get(6)?,
    })
}

fn map_invite_row(row: &rusqlite::Row) -> SqlResult<InviteRow> {
    Ok(InviteRow {
        code: row.get(0)?,
        server_id: row.get(1)?,
        creator_id: row.get(2)?,
        max_uses: row.get(3)?,
        uses: row.get(4)?,
        expires_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}
