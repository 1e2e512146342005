//! Friend graph operations and the direct-message log.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::{Db, FriendMessageRow, FriendRequestRow, FriendStatus, UserRow};
use crate::error::{Error, Result};
use crate::ids::new_id;

const MAX_DM_CHARS: usize = 4000;

pub struct FriendService {
    db: Arc<Mutex<Db>>,
}

impl FriendService {
    pub fn new(db: Arc<Mutex<Db>>) -> Self {
        Self { db }
    }

    pub fn send_request(&self, actor_id: &str, receiver_id: &str) -> Result<FriendRequestRow> {
        if actor_id == receiver_id {
            return Err(Error::invalid_input("cannot befriend yourself"));
        }
        let db = self.db.lock();
        if db.get_user(receiver_id)?.is_none() {
            return Err(Error::not_found("user not found"));
        }
        if db.are_friends(actor_id, receiver_id)? {
            return Err(Error::Conflict("already friends".into()));
        }
        if let Some(existing) = db.get_friend_request_between(actor_id, receiver_id)? {
            return match existing.status {
                FriendStatus::Blocked => Err(Error::forbidden("user is blocked")),
                FriendStatus::Pending => Err(Error::Conflict("request already pending".into())),
                // A rejected or stale accepted row gives way to a new request.
                _ => {
                    db.delete_friend_requests_between(actor_id, receiver_id)?;
                    let id = new_id();
                    db.create_friend_request(&id, actor_id, receiver_id)?;
                    db.get_friend_request(&id)?
                        .ok_or_else(|| Error::Internal("request row vanished".into()))
                }
            };
        }
        let id = new_id();
        db.create_friend_request(&id, actor_id, receiver_id)?;
        db.get_friend_request(&id)?
            .ok_or_else(|| Error::Internal("request row vanished".into()))
    }

    /// Incoming pending requests.
    pub fn list_requests(&self, actor_id: &str) -> Result<Vec<FriendRequestRow>> {
        Ok(self.db.lock().list_pending_requests(actor_id)?)
    }

    /// Only the receiver may accept; acceptance creates the friendship.
    pub fn accept_request(&self, actor_id: &str, request_id: &str) -> Result<()> {
        let db = self.db.lock();
        let request = db
            .get_friend_request(request_id)?
            .ok_or_else(|| Error::not_found("request not found"))?;
        if request.receiver_id != actor_id {
            return Err(Error::forbidden("only the receiver may accept"));
        }
        if request.status != FriendStatus::Pending {
            return Err(Error::Conflict("request is not pending".into()));
        }
        db.update_friend_request_status(request_id, FriendStatus::Accepted)?;
        db.add_friendship(&request.sender_id, &request.receiver_id)?;
        Ok(())
    }

    /// The receiver rejects, or the sender withdraws.
    pub fn decline_request(&self, actor_id: &str, request_id: &str) -> Result<()> {
        let db = self.db.lock();
        let request = db
            .get_friend_request(request_id)?
            .ok_or_else(|| Error::not_found("request not found"))?;
        if request.receiver_id == actor_id {
            db.update_friend_request_status(request_id, FriendStatus::Rejected)?;
            Ok(())
        } else if request.sender_id == actor_id {
            db.delete_friend_request(request_id)?;
            Ok(())
        } else {
            Err(Error::forbidden("not a party to this request"))
        }
    }

    pub fn list_friends(&self, actor_id: &str) -> Result<Vec<UserRow>> {
        Ok(self.db.lock().list_friends(actor_id)?)
    }

    pub fn remove_friend(&self, actor_id: &str, friend_id: &str) -> Result<()> {
        let db = self.db.lock();
        if db.remove_friendship(actor_id, friend_id)? == 0 {
            return Err(Error::not_found("not friends"));
        }
        db.delete_friend_requests_between(actor_id, friend_id)?;
        Ok(())
    }

    /// Block: tear down the friendship and park a blocked marker so new
    /// requests from either side bounce.
    pub fn block(&self, actor_id: &str, target_id: &str) -> Result<()> {
        if actor_id == target_id {
            return Err(Error::invalid_input("cannot block yourself"));
        }
        let db = self.db.lock();
        if db.get_user(target_id)?.is_none() {
            return Err(Error::not_found("user not found"));
        }
        db.remove_friendship(actor_id, target_id)?;
        db.delete_friend_requests_between(actor_id, target_id)?;
        let id = new_id();
        db.create_friend_request(&id, actor_id, target_id)?;
        db.update_friend_request_status(&id, FriendStatus::Blocked)?;
        Ok(())
    }

    /// Unblock removes the marker the actor placed.
    pub fn unblock(&self, actor_id: &str, target_id: &str) -> Result<()> {
        let db = self.db.lock();
        let Some(existing) = db.get_friend_request_between(actor_id, target_id)? else {
            return Err(Error::not_found("no block in place"));
        };
        if existing.status != FriendStatus::Blocked || existing.sender_id != actor_id {
            return Err(Error::not_found("no block in place"));
        }
        db.delete_friend_request(&existing.id)?;
        Ok(())
    }

    pub fn send_dm(
        &self,
        actor_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<FriendMessageRow> {
        if actor_id == receiver_id {
            return Err(Error::invalid_input("cannot message yourself"));
        }
        let trimmed = content.trim();
        let chars = trimmed.chars().count();
        if chars == 0 || chars > MAX_DM_CHARS {
            return Err(Error::invalid_input(format!(
                "message content must be 1..{MAX_DM_CHARS} characters"
            )));
        }
        let db = self.db.lock();
        if let Some(between) = db.get_friend_request_between(actor_id, receiver_id)? {
            if between.status == FriendStatus::Blocked {
                return Err(Error::forbidden("user is blocked"));
            }
        }
        if !db.are_friends(actor_id, receiver_id)? {
            return Err(Error::forbidden("not friends"));
        }
        let row = FriendMessageRow {
            id: new_id(),
            sender_id: actor_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: trimmed.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        db.insert_friend_message(&row)?;
        Ok(row)
    }

    pub fn list_dms(
        &self,
        actor_id: &str,
        other_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FriendMessageRow>> {
        Ok(self
            .db
            .lock()
            .list_friend_messages(actor_id, other_id, after, limit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{memory_db, seed_user};

    fn service() -> FriendService {
        let db = Arc::new(Mutex::new(memory_db()));
        {
            let guard = db.lock();
            seed_user(&guard, "u1", "alice");
            seed_user(&guard, "u2", "bob");
            seed_user(&guard, "u3", "carol");
        }
        FriendService::new(db)
    }

    fn befriend(svc: &FriendService, a: &str, b: &str) {
        let req = svc.send_request(a, b).unwrap();
        svc.accept_request(b, &req.id).unwrap();
    }

    #[test]
    fn request_accept_creates_friendship() {
        let svc = service();
        let req = svc.send_request("u1", "u2").unwrap();
        assert_eq!(svc.list_requests("u2").unwrap().len(), 1);

        svc.accept_request("u2", &req.id).unwrap();
        let friends = svc.list_friends("u1").unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].handle, "bob");
        assert_eq!(svc.list_friends("u2").unwrap()[0].handle, "alice");
    }

    #[test]
    fn only_receiver_accepts() {
        let svc = service();
        let req = svc.send_request("u1", "u2").unwrap();
        assert!(matches!(
            svc.accept_request("u1", &req.id),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            svc.accept_request("u3", &req.id),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn self_request_rejected() {
        let svc = service();
        assert!(matches!(
            svc.send_request("u1", "u1"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn duplicate_pending_conflicts() {
        let svc = service();
        svc.send_request("u1", "u2").unwrap();
        assert!(matches!(
            svc.send_request("u1", "u2"),
            Err(Error::Conflict(_))
        ));
        // Reverse direction also sees the pending row.
        assert!(matches!(
            svc.send_request("u2", "u1"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn rejected_request_can_be_retried() {
        let svc = service();
        let req = svc.send_request("u1", "u2").unwrap();
        svc.decline_request("u2", &req.id).unwrap();
        let again = svc.send_request("u1", "u2").unwrap();
        assert_eq!(again.status, FriendStatus::Pending);
    }

    #[test]
    fn block_prevents_requests_and_dms() {
        let svc = service();
        befriend(&svc, "u1", "u2");
        svc.block("u1", "u2").unwrap();

        assert!(svc.list_friends("u1").unwrap().is_empty());
        assert!(matches!(
            svc.send_request("u2", "u1"),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            svc.send_dm("u2", "u1", "hello?"),
            Err(Error::Forbidden(_))
        ));

        svc.unblock("u1", "u2").unwrap();
        assert!(svc.send_request("u2", "u1").is_ok());
    }

    #[test]
    fn only_blocker_can_unblock() {
        let svc = service();
        svc.block("u1", "u2").unwrap();
        assert!(matches!(
            svc.unblock("u2", "u1"),
            Err(Error::NotFound(_))
        ));
        assert!(svc.unblock("u1", "u2").is_ok());
    }

    #[test]
    fn dm_flow() {
        let svc = service();
        befriend(&svc, "u1", "u2");

        svc.send_dm("u1", "u2", "hey").unwrap();
        svc.send_dm("u2", "u1", "yo").unwrap();

        let log = svc.list_dms("u1", "u2", None, 10).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].content, "hey");

        // Paging forward from the first message.
        let rest = svc.list_dms("u2", "u1", Some(&log[0].id), 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].content, "yo");
    }

    #[test]
    fn dm_requires_friendship() {
        let svc = service();
        assert!(matches!(
            svc.send_dm("u1", "u3", "hi stranger"),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn remove_friend_tears_down() {
        let svc = service();
        befriend(&svc, "u1", "u2");
        svc.remove_friend("u2", "u1").unwrap();
        assert!(svc.list_friends("u1").unwrap().is_empty());
        // A fresh request works again afterwards.
        assert!(svc.send_request("u1", "u2").is_ok());
    }
}
