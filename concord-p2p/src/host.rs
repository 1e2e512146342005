//! The overlay host: identity, transports, discovery, and the
//! `/concord/1.0.0` data-stream protocol.
//!
//! The libp2p swarm runs on one spawned task; the [`Host`] handle talks to
//! it over a command channel. Incoming data streams are read (up to 64 KiB),
//! handed to the registered message handler, and closed — the handler must
//! not block for arbitrary durations or it backpressures the host.
//!
//! Discovery is two independent toggles:
//! - **mDNS** auto-dials peers that appear on the local network.
//! - **Kademlia** (server mode) advertises the configured rendezvous string
//!   as a provider record and periodically dials other providers.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::prelude::*;
use libp2p::core::transport::ListenerId;
use libp2p::kad::store::MemoryStore;
use libp2p::kad::{self, GetProvidersOk, QueryResult, RecordKey};
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identify, identity, mdns, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

/// Application stream protocol id.
pub const PROTOCOL: StreamProtocol = StreamProtocol::new("/concord/1.0.0");

/// Largest inbound payload a data stream will yield.
pub const MAX_STREAM_READ: usize = 64 * 1024;

/// How often the host re-queries the DHT for rendezvous providers.
const RENDEZVOUS_POLL: Duration = Duration::from_secs(30);

/// Handler invoked for every inbound data stream: `(remote peer id, bytes)`.
pub type MessageHandler = Box<dyn Fn(String, Vec<u8>) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("host is stopped")]
    Stopped,
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Host configuration. Identity is caller-supplied when the keypair is
/// persisted externally; otherwise a fresh Ed25519 pair is generated.
pub struct HostConfig {
    pub keypair: Option<identity::Keypair>,
    pub enable_mdns: bool,
    pub enable_dht: bool,
    pub bootstrap: Vec<Multiaddr>,
    /// Rendezvous string to advertise and search, e.g. `concord-room/<code>`.
    pub rendezvous: Option<String>,
    pub listen_tcp: Multiaddr,
    pub listen_quic: Multiaddr,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            keypair: None,
            enable_mdns: false,
            enable_dht: false,
            bootstrap: Vec::new(),
            rendezvous: None,
            listen_tcp: "/ip4/0.0.0.0/tcp/0".parse().expect("static multiaddr"),
            listen_quic: "/ip4/0.0.0.0/udp/0/quic-v1"
                .parse()
                .expect("static multiaddr"),
        }
    }
}

/// One-shot data streams: request is the payload, response is an empty ack.
#[derive(Debug, Clone, Default)]
pub struct DataCodec;

#[async_trait::async_trait]
impl request_response::Codec for DataCodec {
    type Protocol = StreamProtocol;
    type Request = Vec<u8>;
    type Response = ();

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Vec<u8>>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        io.take(MAX_STREAM_READ as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<()>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut sink = [0u8; 1];
        let _ = io.read(&mut sink).await?;
        Ok(())
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        req: Vec<u8>,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(&req).await?;
        io.close().await
    }

    async fn write_response<T>(&mut self, _: &StreamProtocol, io: &mut T, (): ()) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.close().await
    }
}

#[derive(NetworkBehaviour)]
struct HostBehaviour {
    data: request_response::Behaviour<DataCodec>,
    identify: identify::Behaviour,
    kademlia: Toggle<kad::Behaviour<MemoryStore>>,
    mdns: Toggle<mdns::tokio::Behaviour>,
}

enum Command {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), HostError>>,
    },
    SendData {
        peer: PeerId,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), HostError>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Stop,
}

/// Handle to a running overlay host.
pub struct Host {
    peer_id: PeerId,
    rendezvous: Option<String>,
    cmd_tx: mpsc::Sender<Command>,
    peers: Arc<RwLock<HashSet<PeerId>>>,
    handler: Arc<RwLock<Option<MessageHandler>>>,
    stopped: AtomicBool,
}

impl Host {
    /// Build the swarm, start listening, and spawn the event loop.
    pub async fn start(config: HostConfig) -> Result<Self, HostError> {
        let keypair = config
            .keypair
            .clone()
            .unwrap_or_else(identity::Keypair::generate_ed25519);
        let peer_id = PeerId::from(keypair.public());

        let mut swarm = build_swarm(&keypair, &config)
            .map_err(|e| HostError::Transport(e.to_string()))?;

        swarm
            .listen_on(config.listen_tcp.clone())
            .map_err(|e| HostError::Transport(e.to_string()))?;
        swarm
            .listen_on(config.listen_quic.clone())
            .map_err(|e| HostError::Transport(e.to_string()))?;

        // Seed the routing table and kick off a bootstrap walk.
        if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
            kademlia.set_mode(Some(kad::Mode::Server));
            for addr in &config.bootstrap {
                if let Some(peer) = peer_id_from_multiaddr(addr) {
                    kademlia.add_address(&peer, addr.clone());
                }
            }
            if !config.bootstrap.is_empty() {
                let _ = kademlia.bootstrap();
            }
            if let Some(ref rv) = config.rendezvous {
                let key = RecordKey::new(&rv.as_bytes());
                if let Err(e) = kademlia.start_providing(key) {
                    tracing::warn!("failed to advertise rendezvous: {e}");
                }
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let peers = Arc::new(RwLock::new(HashSet::new()));
        let handler: Arc<RwLock<Option<MessageHandler>>> = Arc::new(RwLock::new(None));

        let loop_state = EventLoop {
            swarm,
            local_peer: peer_id,
            cmd_rx,
            peers: Arc::clone(&peers),
            handler: Arc::clone(&handler),
            rendezvous: config.rendezvous.clone(),
            pending_dials: HashMap::new(),
            listen_addrs: HashMap::new(),
        };
        tokio::spawn(loop_state.run());

        tracing::info!(%peer_id, "overlay host started");
        Ok(Self {
            peer_id,
            rendezvous: config.rendezvous,
            cmd_tx,
            peers,
            handler,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The rendezvous string this host advertises, if DHT discovery is on.
    pub fn rendezvous(&self) -> Option<&str> {
        self.rendezvous.as_deref()
    }

    /// Register the inbound message handler. Exactly one handler is held;
    /// registering again replaces the previous one.
    pub fn on_message(&self, handler: MessageHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Dial a multiaddr and wait for the connection to establish.
    pub async fn connect(&self, addr: Multiaddr) -> Result<(), HostError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::Dial { addr, reply: tx }).await?;
        rx.await.map_err(|_| HostError::Stopped)?
    }

    /// Open a fresh stream to `peer`, write `data` once, and close it.
    pub async fn send_data(&self, peer: PeerId, data: Vec<u8>) -> Result<(), HostError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::SendData {
            peer,
            data,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| HostError::Stopped)?
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.read().iter().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Addresses the host is currently listening on.
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, HostError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::ListenAddrs { reply: tx }).await?;
        rx.await.map_err(|_| HostError::Stopped)
    }

    /// Stop the event loop. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Stop).await;
    }

    async fn send_cmd(&self, cmd: Command) -> Result<(), HostError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HostError::Stopped);
        }
        self.cmd_tx.send(cmd).await.map_err(|_| HostError::Stopped)
    }
}

fn build_swarm(
    keypair: &identity::Keypair,
    config: &HostConfig,
) -> anyhow::Result<Swarm<HostBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_quic()
        .with_behaviour(|key| {
            let peer_id = PeerId::from(key.public());

            let data = request_response::Behaviour::with_codec(
                DataCodec,
                [(PROTOCOL, ProtocolSupport::Full)],
                request_response::Config::default(),
            );

            let identify = identify::Behaviour::new(identify::Config::new(
                "/concord/1.0.0".into(),
                key.public(),
            ));

            let kademlia = Toggle::from(config.enable_dht.then(|| {
                kad::Behaviour::with_config(
                    peer_id,
                    MemoryStore::new(peer_id),
                    kad::Config::default(),
                )
            }));

            let mdns = Toggle::from(
                config
                    .enable_mdns
                    .then(|| mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id))
                    .transpose()?,
            );

            Ok(HostBehaviour {
                data,
                identify,
                kademlia,
                mdns,
            })
        })
        .map_err(|e| anyhow::anyhow!("behaviour construction failed: {e}"))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();
    Ok(swarm)
}

/// Extract the trailing `/p2p/<peer>` component, if present.
fn peer_id_from_multiaddr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().last().and_then(|p| match p {
        libp2p::multiaddr::Protocol::P2p(peer) => Some(peer),
        _ => None,
    })
}

struct EventLoop {
    swarm: Swarm<HostBehaviour>,
    local_peer: PeerId,
    cmd_rx: mpsc::Receiver<Command>,
    peers: Arc<RwLock<HashSet<PeerId>>>,
    handler: Arc<RwLock<Option<MessageHandler>>>,
    rendezvous: Option<String>,
    pending_dials: HashMap<libp2p::swarm::ConnectionId, oneshot::Sender<Result<(), HostError>>>,
    listen_addrs: HashMap<ListenerId, Vec<Multiaddr>>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut rendezvous_tick = tokio::time::interval(RENDEZVOUS_POLL);
        rendezvous_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Dial { addr, reply }) => self.handle_dial(addr, reply),
                    Some(Command::SendData { peer, data, reply }) => {
                        self.swarm.behaviour_mut().data.send_request(&peer, data);
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::ListenAddrs { reply }) => {
                        let addrs = self.listen_addrs.values().flatten().cloned().collect();
                        let _ = reply.send(addrs);
                    }
                    Some(Command::Stop) | None => break,
                },
                _ = rendezvous_tick.tick() => self.poll_rendezvous(),
            }
        }
        tracing::debug!(peer_id = %self.local_peer, "overlay host stopped");
    }

    fn handle_dial(&mut self, addr: Multiaddr, reply: oneshot::Sender<Result<(), HostError>>) {
        let opts = DialOpts::unknown_peer_id().address(addr).build();
        let id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(HostError::Dial(e.to_string())));
            }
        }
    }

    fn poll_rendezvous(&mut self) {
        let Some(ref rv) = self.rendezvous else { return };
        if let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() {
            kademlia.get_providers(RecordKey::new(&rv.as_bytes()));
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<HostBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                tracing::info!(%address, "listening");
                self.listen_addrs.entry(listener_id).or_default().push(address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                ..
            } => {
                self.peers.write().insert(peer_id);
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(()));
                }
                tracing::debug!(%peer_id, "peer connected");
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.peers.write().remove(&peer_id);
                    tracing::debug!(%peer_id, "peer disconnected");
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                error,
                ..
            } => {
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(HostError::Dial(error.to_string())));
                }
            }
            SwarmEvent::Behaviour(HostBehaviourEvent::Data(event)) => self.handle_data(event),
            SwarmEvent::Behaviour(HostBehaviourEvent::Mdns(event)) => self.handle_mdns(event),
            SwarmEvent::Behaviour(HostBehaviourEvent::Kademlia(event)) => self.handle_kad(event),
            SwarmEvent::Behaviour(HostBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                // Feed observed addresses into the routing table.
                if let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() {
                    for addr in info.listen_addrs {
                        kademlia.add_address(&peer_id, addr);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_data(&mut self, event: request_response::Event<Vec<u8>, ()>) {
        match event {
            request_response::Event::Message {
                peer,
                message:
                    request_response::Message::Request {
                        request, channel, ..
                    },
            } => {
                if let Some(handler) = self.handler.read().as_ref() {
                    handler(peer.to_string(), request);
                } else {
                    tracing::debug!(%peer, "inbound data dropped: no handler registered");
                }
                let _ = self.swarm.behaviour_mut().data.send_response(channel, ());
            }
            request_response::Event::Message {
                message: request_response::Message::Response { .. },
                ..
            } => {}
            request_response::Event::OutboundFailure { peer, error, .. } => {
                tracing::warn!(%peer, "outbound stream failed: {error}");
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                tracing::debug!(%peer, "inbound stream failed: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn handle_mdns(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(list) => {
                for (peer, addr) in list {
                    if peer == self.local_peer {
                        continue;
                    }
                    tracing::debug!(%peer, %addr, "mdns discovered peer");
                    if let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() {
                        kademlia.add_address(&peer, addr.clone());
                    }
                    if let Err(e) = self.swarm.dial(addr) {
                        tracing::debug!(%peer, "mdns dial failed: {e}");
                    }
                }
            }
            mdns::Event::Expired(_) => {}
        }
    }

    fn handle_kad(&mut self, event: kad::Event) {
        if let kad::Event::OutboundQueryProgressed {
            result: QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })),
            ..
        } = event
        {
            for peer in providers {
                if peer == self.local_peer || self.peers.read().contains(&peer) {
                    continue;
                }
                tracing::debug!(%peer, "rendezvous provider found, dialing");
                if let Err(e) = self.swarm.dial(DialOpts::peer_id(peer).build()) {
                    tracing::debug!(%peer, "provider dial failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_peer_extraction() {
        let with_peer: Multiaddr =
            "/ip4/10.0.0.1/tcp/4001/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"
                .parse()
                .unwrap();
        assert!(peer_id_from_multiaddr(&with_peer).is_some());

        let without: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        assert!(peer_id_from_multiaddr(&without).is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let host = Host::start(HostConfig::default()).await.unwrap();
        host.stop().await;
        host.stop().await;
        assert!(matches!(
            host.send_data(PeerId::random(), vec![1]).await,
            Err(HostError::Stopped)
        ));
    }

    #[tokio::test]
    async fn fresh_host_has_no_peers() {
        let host = Host::start(HostConfig::default()).await.unwrap();
        assert_eq!(host.peer_count(), 0);
        assert!(host.peers().is_empty());
        host.stop().await;
    }
}
