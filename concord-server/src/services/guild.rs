//! Guild orchestration: servers, channels, members, invites, and the cache
//! prefixes their list reads live under.
//!
//! Prefixes: `servers:u:{userId}:`, `channels:s:{serverId}:`,
//! `members:s:{serverId}:`. Every mutation purges the affected prefixes
//! before returning, so a reader that misses right after a mutation
//! re-reads post-mutation state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::cache::SharedCache;
use crate::db::{ChannelRow, Db, InviteRow, MemberRow, ServerRow};
use crate::error::{Error, Result};
use crate::ids::new_id;

const LIST_TTL: Duration = Duration::from_secs(60);
const INVITE_CODE_LEN: usize = 8;

pub struct GuildService {
    db: Arc<Mutex<Db>>,
    cache: Arc<SharedCache>,
}

impl GuildService {
    pub fn new(db: Arc<Mutex<Db>>, cache: Arc<SharedCache>) -> Self {
        Self { db, cache }
    }

    // ── Servers ────────────────────────────────────────────────────────

    pub fn list_servers(&self, user_id: &str) -> Result<Vec<ServerRow>> {
        let key = format!("servers:u:{user_id}:all");
        if let Some(cached) = self.cache.get_as::<Vec<ServerRow>>(&key) {
            return Ok(cached);
        }
        let servers = self.db.lock().list_servers_for_user(user_id)?;
        self.cache.set_as(key, &servers, LIST_TTL);
        Ok(servers)
    }

    pub fn create_server(
        &self,
        actor_id: &str,
        name: &str,
        icon_url: Option<String>,
    ) -> Result<ServerRow> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 100 {
            return Err(Error::invalid_input("server name must be 1..100 chars"));
        }
        let now = chrono::Utc::now().timestamp_millis();
        let server = ServerRow {
            id: new_id(),
            name: name.to_string(),
            icon_url,
            owner_id: actor_id.to_string(),
            invite_code: None,
            created_at: now,
            updated_at: now,
        };
        self.db.lock().create_server(&server)?;
        self.cache.delete_prefix(&format!("servers:u:{actor_id}:"));
        Ok(server)
    }

    pub fn update_server(
        &self,
        actor_id: &str,
        server_id: &str,
        name: &str,
        icon_url: Option<String>,
    ) -> Result<ServerRow> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 100 {
            return Err(Error::invalid_input("server name must be 1..100 chars"));
        }
        let member_ids;
        {
            let db = self.db.lock();
            self.require_role(&db, server_id, actor_id, &["owner", "admin"])?;
            db.update_server(server_id, name, icon_url.as_deref())?;
            member_ids = db.list_member_ids(server_id)?;
        }
        self.purge_server(server_id, &member_ids);
        let server = self
            .db
            .lock()
            .get_server(server_id)?
            .ok_or_else(|| Error::not_found("server not found"))?;
        Ok(server)
    }

    pub fn delete_server(&self, actor_id: &str, server_id: &str) -> Result<()> {
        let member_ids;
        {
            let db = self.db.lock();
            let server = db
                .get_server(server_id)?
                .ok_or_else(|| Error::not_found("server not found"))?;
            if server.owner_id != actor_id {
                return Err(Error::forbidden("only the owner may delete a server"));
            }
            member_ids = db.list_member_ids(server_id)?;
            db.delete_server(server_id)?;
        }
        self.purge_server(server_id, &member_ids);
        Ok(())
    }

    // ── Channels ───────────────────────────────────────────────────────

    pub fn list_channels(&self, actor_id: &str, server_id: &str) -> Result<Vec<ChannelRow>> {
        {
            let db = self.db.lock();
            self.require_member(&db, server_id, actor_id)?;
        }
        let key = format!("channels:s:{server_id}:all");
        if let Some(cached) = self.cache.get_as::<Vec<ChannelRow>>(&key) {
            return Ok(cached);
        }
        let channels = self.db.lock().list_channels(server_id)?;
        self.cache.set_as(key, &channels, LIST_TTL);
        Ok(channels)
    }

    pub fn create_channel(
        &self,
        actor_id: &str,
        server_id: &str,
        name: &str,
        kind: &str,
    ) -> Result<ChannelRow> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 100 {
            return Err(Error::invalid_input("channel name must be 1..100 chars"));
        }
        if kind != "text" && kind != "voice" {
            return Err(Error::invalid_input("channel type must be text or voice"));
        }
        let channel;
        {
            let db = self.db.lock();
            self.require_role(&db, server_id, actor_id, &["owner", "admin"])?;
            let position = db.list_channels(server_id)?.len() as i64;
            channel = ChannelRow {
                id: new_id(),
                server_id: server_id.to_string(),
                name: name.to_string(),
                kind: kind.to_string(),
                position,
                created_at: chrono::Utc::now().timestamp_millis(),
            };
            db.create_channel(&channel)?;
        }
        self.cache.delete_prefix(&format!("channels:s:{server_id}:"));
        Ok(channel)
    }

    // ── Members ────────────────────────────────────────────────────────

    pub fn list_members(&self, actor_id: &str, server_id: &str) -> Result<Vec<MemberRow>> {
        {
            let db = self.db.lock();
            self.require_member(&db, server_id, actor_id)?;
        }
        let key = format!("members:s:{server_id}:all");
        if let Some(cached) = self.cache.get_as::<Vec<MemberRow>>(&key) {
            return Ok(cached);
        }
        let members = self.db.lock().list_members(server_id)?;
        self.cache.set_as(key, &members, LIST_TTL);
        Ok(members)
    }

    /// Kick a member, or leave when `actor_id == user_id`. The owner can
    /// never be removed.
    pub fn remove_member(&self, actor_id: &str, server_id: &str, user_id: &str) -> Result<()> {
        {
            let db = self.db.lock();
            let server = db
                .get_server(server_id)?
                .ok_or_else(|| Error::not_found("server not found"))?;
            if server.owner_id == user_id {
                return Err(Error::forbidden("the owner cannot be removed"));
            }
            if actor_id != user_id {
                self.require_role(&db, server_id, actor_id, &["owner", "admin"])?;
            }
            if db.remove_member(server_id, user_id)? == 0 {
                return Err(Error::not_found("member not found"));
            }
        }
        self.cache.delete_prefix(&format!("members:s:{server_id}:"));
        self.cache.delete_prefix(&format!("servers:u:{user_id}:"));
        Ok(())
    }

    pub fn update_member_role(
        &self,
        actor_id: &str,
        server_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<()> {
        if !matches!(role, "admin" | "moderator" | "member") {
            return Err(Error::invalid_input(
                "role must be admin, moderator, or member",
            ));
        }
        {
            let db = self.db.lock();
            let server = db
                .get_server(server_id)?
                .ok_or_else(|| Error::not_found("server not found"))?;
            if server.owner_id == user_id {
                return Err(Error::forbidden("the owner role is fixed"));
            }
            self.require_role(&db, server_id, actor_id, &["owner", "admin"])?;
            if db.update_member_role(server_id, user_id, role)? == 0 {
                return Err(Error::not_found("member not found"));
            }
        }
        self.cache.delete_prefix(&format!("members:s:{server_id}:"));
        Ok(())
    }

    // ── Invites ────────────────────────────────────────────────────────

    pub fn create_invite(
        &self,
        actor_id: &str,
        server_id: &str,
        max_uses: i64,
        expires_at: Option<i64>,
    ) -> Result<InviteRow> {
        let db = self.db.lock();
        self.require_role(&db, server_id, actor_id, &["owner", "admin", "moderator"])?;
        let invite = InviteRow {
            code: invite_code(),
            server_id: server_id.to_string(),
            creator_id: actor_id.to_string(),
            max_uses: max_uses.max(0),
            uses: 0,
            expires_at,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        db.create_invite(&invite)?;
        Ok(invite)
    }

    /// Redeem an invite. Idempotent on success: an existing member gets OK
    /// back without the use counter moving.
    pub fn redeem_invite(&self, actor_id: &str, code: &str) -> Result<ServerRow> {
        let server;
        {
            let db = self.db.lock();
            let invite = db
                .get_invite(code)?
                .ok_or_else(|| Error::not_found("invite not found"))?;
            server = db
                .get_server(&invite.server_id)?
                .ok_or_else(|| Error::not_found("server not found"))?;

            if db.get_member(&invite.server_id, actor_id)?.is_some() {
                return Ok(server);
            }
            if let Some(expiry) = invite.expires_at {
                if expiry <= chrono::Utc::now().timestamp_millis() {
                    return Err(Error::Conflict("invite expired".into()));
                }
            }
            if invite.max_uses > 0 && invite.uses >= invite.max_uses {
                return Err(Error::Conflict("invite exhausted".into()));
            }
            db.add_member(&invite.server_id, actor_id, "member")?;
            db.increment_invite_uses(code)?;
        }
        self.cache
            .delete_prefix(&format!("members:s:{}:", server.id));
        self.cache.delete_prefix(&format!("servers:u:{actor_id}:"));
        Ok(server)
    }

    // ── Helpers ────────────────────────────────────────────────────────

    fn require_member(&self, db: &Db, server_id: &str, user_id: &str) -> Result<MemberRow> {
        db.get_member(server_id, user_id)?
            .ok_or_else(|| Error::forbidden("not a member of this server"))
    }

    fn require_role(
        &self,
        db: &Db,
        server_id: &str,
        user_id: &str,
        roles: &[&str],
    ) -> Result<MemberRow> {
        let member = self.require_member(db, server_id, user_id)?;
        if roles.contains(&member.role.as_str()) {
            Ok(member)
        } else {
            Err(Error::forbidden("insufficient role"))
        }
    }

    fn purge_server(&self, server_id: &str, member_ids: &[String]) {
        self.cache.delete_prefix(&format!("channels:s:{server_id}:"));
        self.cache.delete_prefix(&format!("members:s:{server_id}:"));
        for user in member_ids {
            self.cache.delete_prefix(&format!("servers:u:{user}:"));
        }
    }
}

fn invite_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INVITE_CODE_LEN)
        .map(char::from)
        .collect()
}
