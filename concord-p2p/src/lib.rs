//! Concord peer-to-peer overlay.
//!
//! A [`host::Host`] owns the libp2p swarm: TCP and QUIC transports secured
//! with Noise, optional mDNS LAN discovery, optional Kademlia rendezvous
//! over a [`room`] code, and the `/concord/1.0.0` one-shot data streams.
//! Payloads are framed with the [`wire`] codec and sealed per-peer by the
//! [`e2ee`] manager.

pub mod e2ee;
pub mod host;
pub mod room;
pub mod wire;

pub use libp2p;

pub use e2ee::{E2eeError, E2eeManager};
pub use host::{Host, HostConfig, HostError, MessageHandler};
pub use room::{rendezvous_string, room_code};
pub use wire::{Envelope, MessageType, WireError, MAX_PAYLOAD_SIZE};
