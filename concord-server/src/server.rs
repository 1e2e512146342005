//! Component wiring and process lifecycle.
//!
//! `build_state` constructs every long-lived component; `run` serves HTTP
//! until ctrl-c, then drains in-flight handlers for at most the configured
//! timeout before stopping the presence reaper and the overlay host.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;

use concord_p2p::{room_code, wire, Host, HostConfig};

use crate::cache::SharedCache;
use crate::config::Config;
use crate::db::{self, Db};
use crate::jwt::JwtManager;
use crate::oauth::IdentityProvider;
use crate::presence::PresenceTracker;
use crate::queue::MessageQueue;
use crate::services::{AuthService, ChatService, FriendService, GuildService};
use crate::translate::TranslationClient;
use crate::ws::SignalHub;

pub struct AppState {
    pub config: Config,
    pub auth: AuthService,
    pub guilds: GuildService,
    pub chat: ChatService,
    pub friends: FriendService,
    pub translator: TranslationClient,
    pub hub: Arc<SignalHub>,
    pub presence: Arc<PresenceTracker>,
}

/// Construct every component. Must run inside the tokio runtime — the
/// presence tracker spawns its reaper here.
pub fn build_state(
    config: Config,
    provider: Arc<dyn IdentityProvider>,
) -> Result<Arc<AppState>> {
    let jwt = Arc::new(JwtManager::new(&config.jwt_secret)?);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let session_key = db::session_key_from_secret(&config.jwt_secret);
    let database = Db::open(config.db_path(), session_key)
        .with_context(|| format!("opening database {}", config.db_path().display()))?;
    let database = Arc::new(Mutex::new(database));

    let cache = Arc::new(SharedCache::new(config.cache_capacity));
    let presence = PresenceTracker::start(Duration::from_secs(config.presence_ttl_secs));
    let queue = Arc::new(MessageQueue::new());
    let hub = Arc::new(SignalHub::new());

    let auth = AuthService::new(
        Arc::clone(&database),
        jwt,
        provider,
        config.rotate_refresh_on_restore,
    );
    let guilds = GuildService::new(Arc::clone(&database), Arc::clone(&cache));
    let chat = ChatService::new(
        Arc::clone(&database),
        Arc::clone(&cache),
        Arc::clone(&presence),
        queue,
        Arc::clone(&hub) as Arc<dyn crate::services::Notifier>,
    );
    let friends = FriendService::new(Arc::clone(&database));
    let translator = TranslationClient::new(config.translation.clone(), Arc::clone(&cache));

    Ok(Arc::new(AppState {
        config,
        auth,
        guilds,
        chat,
        friends,
        translator,
        hub,
        presence,
    }))
}

/// Serve until ctrl-c; drain, then stop background components.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("HTTP listening on {addr}");

    let host = if state.config.p2p.enabled {
        Some(start_overlay(&state).await?)
    } else {
        None
    };

    let app = crate::web::router(Arc::clone(&state));

    let sweeper = {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tick.tick().await;
                match state.auth.clean_expired_sessions() {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("reaped {n} expired sessions"),
                    Err(e) => tracing::warn!("session sweep failed: {e}"),
                }
            }
        })
    };

    let drained = Arc::new(tokio::sync::Notify::new());
    let signal_seen = Arc::clone(&drained);
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining");
        signal_seen.notify_waiters();
    });
    let force_close = async {
        drained.notified().await;
        tokio::time::sleep(Duration::from_secs(state.config.shutdown_timeout_secs)).await;
    };

    tokio::select! {
        result = serve => result?,
        _ = force_close => tracing::warn!("drain timeout elapsed, forcing close"),
    }

    sweeper.abort();
    state.presence.stop();
    if let Some(host) = host {
        host.stop().await;
    }
    tracing::info!("server stopped");
    Ok(())
}

/// Bring up the overlay host next to the HTTP listener. The server joins
/// discovery and accepts `/concord/1.0.0` envelopes from LAN/WAN peers.
async fn start_overlay(state: &Arc<AppState>) -> Result<Host> {
    let keypair = concord_p2p::libp2p::identity::Keypair::generate_ed25519();
    let peer_id = keypair.public().to_peer_id();
    let code = room_code(&peer_id.to_string());

    let mut bootstrap = Vec::new();
    for addr in &state.config.p2p.bootstrap {
        match addr.parse() {
            Ok(multiaddr) => bootstrap.push(multiaddr),
            Err(e) => tracing::warn!("skipping invalid bootstrap addr {addr}: {e}"),
        }
    }

    let host = Host::start(HostConfig {
        keypair: Some(keypair),
        enable_mdns: state.config.p2p.mdns,
        enable_dht: state.config.p2p.dht,
        bootstrap,
        rendezvous: state
            .config
            .p2p
            .dht
            .then(|| concord_p2p::rendezvous_string(&code)),
        ..HostConfig::default()
    })
    .await?;

    tracing::info!(peer_id = %host.peer_id(), room = %code, "overlay host running");

    let presence = Arc::clone(&state.presence);
    host.on_message(Box::new(move |peer, bytes| {
        match wire::decode(&bytes) {
            Ok(envelope) => handle_overlay_envelope(&presence, &peer, &envelope),
            // Undecodable payloads are most likely E2EE blobs addressed to
            // another peer; nothing for the server to do with them.
            Err(e) => tracing::debug!(%peer, "ignoring overlay payload: {e}"),
        }
    }));

    Ok(host)
}

fn handle_overlay_envelope(presence: &PresenceTracker, peer: &str, envelope: &wire::Envelope) {
    match envelope.msg_type {
        wire::MessageType::Presence => {
            if let Ok(update) = envelope.payload_as::<wire::Presence>() {
                if update.online {
                    presence.touch(&update.user);
                } else {
                    presence.set_offline(&update.user);
                }
            }
        }
        wire::MessageType::Ping => {
            tracing::debug!(%peer, "overlay ping");
        }
        other => {
            tracing::debug!(%peer, ?other, "overlay envelope received");
        }
    }
}
