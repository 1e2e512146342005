//! WebRTC signaling over WebSocket, plus server-pushed chat events.
//!
//! Clients connect to `/api/v1/ws?token=<access-token>`; the token's
//! subject is the peer's identity. Frames are JSON
//! `{type, from, to, payload}` with the WebRTC set (join, leave, offer,
//! answer, ice-candidate, ping, pong); the server additionally pushes
//! `message` frames for chat fan-out and drains the offline queue on join.
//!
//! Keepalive: the server pings every 30 s and reaps a peer after 60 s of
//! silence. Clients reconnect with exponential backoff (1 s → 30 s).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::services::chat::{ChatEvent, Notifier};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SignalMessage {
    fn server(kind: &str, to: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            from: "server".to_string(),
            to: to.to_string(),
            payload,
        }
    }
}

struct Peer {
    tx: mpsc::UnboundedSender<SignalMessage>,
}

/// Connected-peer registry. One entry per user; a reconnect replaces the
/// previous sender.
#[derive(Default)]
pub struct SignalHub {
    peers: Mutex<HashMap<String, Peer>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a live connection for `user_id`, replacing any previous one.
    pub fn register(&self, user_id: &str, tx: mpsc::UnboundedSender<SignalMessage>) {
        self.peers.lock().insert(user_id.to_string(), Peer { tx });
    }

    pub fn unregister(&self, user_id: &str) {
        self.peers.lock().remove(user_id);
    }

    pub fn connected_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Forward a frame to a connected peer. Returns false when the peer has
    /// no live socket.
    pub fn send_to(&self, user_id: &str, message: SignalMessage) -> bool {
        match self.peers.lock().get(user_id) {
            Some(peer) => peer.tx.send(message).is_ok(),
            None => false,
        }
    }
}

impl Notifier for SignalHub {
    fn notify(&self, user_id: &str, event: &ChatEvent) -> bool {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(_) => return false,
        };
        self.send_to(user_id, SignalMessage::server("message", user_id, payload))
    }
}

/// Drive one upgraded socket until the peer leaves, goes silent, or the
/// transport drops.
pub async fn run_connection(socket: WebSocket, user_id: String, state: Arc<crate::server::AppState>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();
    state.hub.register(&user_id, tx);
    state.presence.touch(&user_id);
    tracing::debug!(%user_id, "signaling peer connected");

    let mut socket = socket;
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    let mut clean_leave = false;

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_seen = Instant::now();
                        state.presence.touch(&user_id);
                        let Ok(msg) = serde_json::from_str::<SignalMessage>(&text) else {
                            tracing::debug!(%user_id, "dropping malformed signal frame");
                            continue;
                        };
                        match msg.kind.as_str() {
                            "join" => {
                                // Flush everything parked while offline.
                                for event in state.chat.drain_offline(&user_id) {
                                    if let Ok(payload) = serde_json::to_value(&event) {
                                        let _ = state.hub.send_to(
                                            &user_id,
                                            SignalMessage::server("message", &user_id, payload),
                                        );
                                    }
                                }
                            }
                            "leave" => {
                                clean_leave = true;
                                break;
                            }
                            "ping" => {
                                let _ = state.hub.send_to(
                                    &user_id,
                                    SignalMessage::server("pong", &user_id, serde_json::Value::Null),
                                );
                            }
                            "pong" => {}
                            "offer" | "answer" | "ice-candidate" => {
                                let mut forward = msg.clone();
                                forward.from = user_id.clone();
                                if !state.hub.send_to(&msg.to, forward) {
                                    tracing::debug!(%user_id, to = %msg.to, "signal target offline");
                                }
                            }
                            other => {
                                tracing::debug!(%user_id, kind = other, "unknown signal type");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(_)) => break,
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let Ok(text) = serde_json::to_string(&msg) else { continue };
                        if socket.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = keepalive.tick() => {
                if last_seen.elapsed() > STALE_AFTER {
                    tracing::debug!(%user_id, "reaping stale signaling peer");
                    break;
                }
                let ping = SignalMessage::server("ping", &user_id, serde_json::Value::Null);
                let Ok(text) = serde_json::to_string(&ping) else { continue };
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.unregister(&user_id);
    if clean_leave {
        state.presence.set_offline(&user_id);
    }
    let _ = socket.send(WsMessage::Close(None)).await;
    tracing::debug!(%user_id, "signaling peer disconnected");
}
