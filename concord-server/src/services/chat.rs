//! Message orchestration: validation, persistence, cache coherency, and
//! fan-out to online and offline members.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::SharedCache;
use crate::db::{Db, MessageRow, SearchResultRow};
use crate::error::{Error, Result};
use crate::ids::new_id;
use crate::presence::PresenceTracker;
use crate::queue::MessageQueue;

const MAX_CONTENT_CHARS: usize = 4000;
const PAGE_TTL: Duration = Duration::from_secs(30);

/// Events pushed to connected clients and parked in the offline queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChatEvent {
    MessageCreated { message: MessageRow },
    MessageEdited { message: MessageRow },
    MessageDeleted { message_id: String, channel_id: String },
}

/// Delivery seam: the WebSocket hub implements this. Returns `false` when
/// the user has no live connection.
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: &str, event: &ChatEvent) -> bool;
}

pub struct ChatService {
    db: Arc<Mutex<Db>>,
    cache: Arc<SharedCache>,
    presence: Arc<PresenceTracker>,
    queue: Arc<MessageQueue<ChatEvent>>,
    notifier: Arc<dyn Notifier>,
}

impl ChatService {
    pub fn new(
        db: Arc<Mutex<Db>>,
        cache: Arc<SharedCache>,
        presence: Arc<PresenceTracker>,
        queue: Arc<MessageQueue<ChatEvent>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            cache,
            presence,
            queue,
            notifier,
        }
    }

    /// Validate, persist, invalidate, fan out, return the row.
    pub fn send_message(
        &self,
        actor_id: &str,
        channel_id: &str,
        content: &str,
    ) -> Result<MessageRow> {
        let content = validate_content(content)?;
        let message;
        let member_ids;
        {
            let db = self.db.lock();
            let channel = db
                .get_channel(channel_id)?
                .ok_or_else(|| Error::not_found("channel not found"))?;
            if db.get_member(&channel.server_id, actor_id)?.is_none() {
                return Err(Error::forbidden("not a member of this server"));
            }
            message = MessageRow {
                id: new_id(),
                channel_id: channel_id.to_string(),
                author_id: actor_id.to_string(),
                content,
                kind: "text".into(),
                edited_at: None,
                created_at: chrono::Utc::now().timestamp_millis(),
            };
            db.insert_message(&message)?;
            member_ids = db.list_member_ids(&channel.server_id)?;
        }
        self.cache.delete_prefix(&format!("messages:c:{channel_id}:"));
        self.fan_out(
            actor_id,
            &member_ids,
            &ChatEvent::MessageCreated {
                message: message.clone(),
            },
        );
        Ok(message)
    }

    /// Only the author may edit. Sets `edited_at`; the author never changes.
    pub fn edit_message(
        &self,
        actor_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<MessageRow> {
        let content = validate_content(content)?;
        let updated;
        let member_ids;
        {
            let db = self.db.lock();
            let existing = db
                .get_message(message_id)?
                .ok_or_else(|| Error::not_found("message not found"))?;
            if existing.author_id != actor_id {
                return Err(Error::forbidden("only the author may edit a message"));
            }
            db.edit_message(message_id, &content)?;
            updated = db
                .get_message(message_id)?
                .ok_or_else(|| Error::not_found("message not found"))?;
            let channel = db
                .get_channel(&updated.channel_id)?
                .ok_or_else(|| Error::not_found("channel not found"))?;
            member_ids = db.list_member_ids(&channel.server_id)?;
        }
        self.cache
            .delete_prefix(&format!("messages:c:{}:", updated.channel_id));
        self.fan_out(
            actor_id,
            &member_ids,
            &ChatEvent::MessageEdited {
                message: updated.clone(),
            },
        );
        Ok(updated)
    }

    /// The author — or a manager — may delete. Attachments cascade.
    pub fn delete_message(
        &self,
        actor_id: &str,
        message_id: &str,
        is_manager: bool,
    ) -> Result<()> {
        let channel_id;
        let member_ids;
        {
            let db = self.db.lock();
            let existing = db
                .get_message(message_id)?
                .ok_or_else(|| Error::not_found("message not found"))?;
            if existing.author_id != actor_id && !is_manager {
                return Err(Error::forbidden(
                    "only the author or a manager may delete a message",
                ));
            }
            channel_id = existing.channel_id.clone();
            db.delete_message(message_id)?;
            member_ids = match db.get_channel(&channel_id)? {
                Some(channel) => db.list_member_ids(&channel.server_id)?,
                None => Vec::new(),
            };
        }
        self.cache.delete_prefix(&format!("messages:c:{channel_id}:"));
        self.fan_out(
            actor_id,
            &member_ids,
            &ChatEvent::MessageDeleted {
                message_id: message_id.to_string(),
                channel_id,
            },
        );
        Ok(())
    }

    /// Cursor-paged history, cache-first. At most one of `before`/`after`.
    pub fn get_messages(
        &self,
        actor_id: &str,
        channel_id: &str,
        before: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageRow>> {
        if before.is_some() && after.is_some() {
            return Err(Error::invalid_input(
                "before and after are mutually exclusive",
            ));
        }
        {
            let db = self.db.lock();
            let channel = db
                .get_channel(channel_id)?
                .ok_or_else(|| Error::not_found("channel not found"))?;
            if db.get_member(&channel.server_id, actor_id)?.is_none() {
                return Err(Error::forbidden("not a member of this server"));
            }
        }
        let key = format!(
            "messages:c:{channel_id}:{}:{}:{limit}",
            before.unwrap_or("-"),
            after.unwrap_or("-"),
        );
        if let Some(cached) = self.cache.get_as::<Vec<MessageRow>>(&key) {
            return Ok(cached);
        }
        let page = self
            .db
            .lock()
            .get_messages(channel_id, before, after, limit)?;
        self.cache.set_as(key, &page, PAGE_TTL);
        Ok(page)
    }

    /// Ranked full-text search within a channel the actor can see.
    pub fn search_messages(
        &self,
        actor_id: &str,
        channel_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResultRow>> {
        let db = self.db.lock();
        let channel = db
            .get_channel(channel_id)?
            .ok_or_else(|| Error::not_found("channel not found"))?;
        if db.get_member(&channel.server_id, actor_id)?.is_none() {
            return Err(Error::forbidden("not a member of this server"));
        }
        Ok(db.search_messages(channel_id, query, limit)?)
    }

    /// Pending events parked while the user was offline.
    pub fn drain_offline(&self, user_id: &str) -> Vec<ChatEvent> {
        self.queue.drain(user_id)
    }

    fn fan_out(&self, actor_id: &str, member_ids: &[String], event: &ChatEvent) {
        for member in member_ids {
            if member == actor_id {
                continue;
            }
            let delivered = self.presence.is_online(member) && self.notifier.notify(member, event);
            if !delivered {
                self.queue.enqueue(member, event.clone());
            }
        }
    }
}

fn validate_content(content: &str) -> Result<String> {
    let trimmed = content.trim();
    let chars = trimmed.chars().count();
    if chars == 0 {
        return Err(Error::invalid_input("message content must not be empty"));
    }
    if chars > MAX_CONTENT_CHARS {
        return Err(Error::invalid_input(format!(
            "message content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}
