//! Message round-trip, authorization, fan-out, and cache-coherency
//! scenarios across the guild and chat services.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use concord_server::cache::SharedCache;
use concord_server::db::{Db, UserRow};
use concord_server::error::Error;
use concord_server::presence::PresenceTracker;
use concord_server::queue::MessageQueue;
use concord_server::services::{ChatEvent, ChatService, GuildService, Notifier};
use concord_server::ws::SignalHub;

fn seed_user(db: &Db, id: &str, handle: &str) {
    let now = chrono::Utc::now().timestamp_millis();
    db.upsert_user(&UserRow {
        id: id.into(),
        external_id: format!("ext-{id}"),
        handle: handle.into(),
        display_name: handle.into(),
        avatar_url: None,
        created_at: now,
        updated_at: now,
    })
    .unwrap();
}

struct World {
    guilds: GuildService,
    chat: ChatService,
    hub: Arc<SignalHub>,
    queue: Arc<MessageQueue<ChatEvent>>,
    presence: Arc<PresenceTracker>,
}

fn world() -> World {
    let db = Arc::new(Mutex::new(Db::open_memory([42u8; 32]).unwrap()));
    {
        let guard = db.lock();
        seed_user(&guard, "m1", "mallory");
        seed_user(&guard, "m2", "max");
    }
    let cache = Arc::new(SharedCache::new(512));
    let presence = PresenceTracker::start(Duration::from_secs(60));
    let queue = Arc::new(MessageQueue::new());
    let hub = Arc::new(SignalHub::new());
    let guilds = GuildService::new(Arc::clone(&db), Arc::clone(&cache));
    let chat = ChatService::new(
        db,
        cache,
        Arc::clone(&presence),
        Arc::clone(&queue),
        Arc::clone(&hub) as Arc<dyn Notifier>,
    );
    World {
        guilds,
        chat,
        hub,
        queue,
        presence,
    }
}

#[tokio::test]
async fn message_roundtrip_with_search() {
    let w = world();
    let server = w.guilds.create_server("m1", "Team", None).unwrap();
    let invite = w.guilds.create_invite("m1", &server.id, 0, None).unwrap();
    w.guilds.redeem_invite("m2", &invite.code).unwrap();
    let channel = w
        .guilds
        .create_channel("m1", &server.id, "general", "text")
        .unwrap();

    let row = w.chat.send_message("m1", &channel.id, "hello").unwrap();

    let page = w.chat.get_messages("m2", &channel.id, None, None, 10).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, row.id);
    assert_eq!(page[0].content, "hello");

    let hits = w.chat.search_messages("m2", &channel.id, "hell", 0).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].message_id, row.id);
    assert!(hits[0].snippet.contains("<mark>hell</mark>o"));
}

#[tokio::test]
async fn edit_delete_authorization_matrix() {
    let w = world();
    let server = w.guilds.create_server("m1", "Team", None).unwrap();
    let invite = w.guilds.create_invite("m1", &server.id, 0, None).unwrap();
    w.guilds.redeem_invite("m2", &invite.code).unwrap();
    let channel = w
        .guilds
        .create_channel("m1", &server.id, "general", "text")
        .unwrap();
    let row = w.chat.send_message("m1", &channel.id, "hello").unwrap();

    // A non-author without manager rights can neither edit nor delete.
    assert!(matches!(
        w.chat.edit_message("m2", &row.id, "x"),
        Err(Error::Forbidden(_))
    ));
    assert!(matches!(
        w.chat.delete_message("m2", &row.id, false),
        Err(Error::Forbidden(_))
    ));

    // The author deletes without any manager flag.
    w.chat.delete_message("m1", &row.id, false).unwrap();
    assert!(w
        .chat
        .get_messages("m1", &channel.id, None, None, 10)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn channel_list_is_coherent_after_create() {
    let w = world();
    let server = w.guilds.create_server("m1", "Team", None).unwrap();
    w.guilds
        .create_channel("m1", &server.id, "general", "text")
        .unwrap();

    // Populate the cache, mutate, and require the fresh row to show up.
    let before = w.guilds.list_channels("m1", &server.id).unwrap();
    assert_eq!(before.len(), 1);

    w.guilds
        .create_channel("m1", &server.id, "announcements", "text")
        .unwrap();
    let after = w.guilds.list_channels("m1", &server.id).unwrap();
    assert_eq!(after.len(), 2, "stale channel list after create");
    assert!(after.iter().any(|c| c.name == "announcements"));
}

#[tokio::test]
async fn offline_member_queue_drains_in_order() {
    let w = world();
    let server = w.guilds.create_server("m1", "Team", None).unwrap();
    let invite = w.guilds.create_invite("m1", &server.id, 0, None).unwrap();
    w.guilds.redeem_invite("m2", &invite.code).unwrap();
    let channel = w
        .guilds
        .create_channel("m1", &server.id, "general", "text")
        .unwrap();

    w.chat.send_message("m1", &channel.id, "first").unwrap();
    w.chat.send_message("m1", &channel.id, "second").unwrap();
    assert_eq!(w.queue.pending("m2"), 2);

    let drained = w.chat.drain_offline("m2");
    let contents: Vec<_> = drained
        .iter()
        .map(|e| match e {
            ChatEvent::MessageCreated { message } => message.content.clone(),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(contents, ["first", "second"]);
    assert_eq!(w.queue.pending("m2"), 0);
}

#[tokio::test]
async fn connected_member_receives_push() {
    let w = world();
    let server = w.guilds.create_server("m1", "Team", None).unwrap();
    let invite = w.guilds.create_invite("m1", &server.id, 0, None).unwrap();
    w.guilds.redeem_invite("m2", &invite.code).unwrap();
    let channel = w
        .guilds
        .create_channel("m1", &server.id, "general", "text")
        .unwrap();

    // Simulate a live signaling connection for m2.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    w.presence.touch("m2");
    w.hub.register("m2", tx);

    w.chat.send_message("m1", &channel.id, "push me").unwrap();

    let frame = rx.try_recv().expect("event pushed to connected member");
    assert_eq!(frame.kind, "message");
    assert_eq!(frame.payload["message"]["content"], "push me");
    assert_eq!(w.queue.pending("m2"), 0, "delivered events are not queued");
}
