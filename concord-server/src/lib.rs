//! Concord central coordination server.
//!
//! Authenticated HTTP + WebSocket signaling over a SQLite store with
//! full-text search, a TTL'd LRU cache for the hot list reads, presence
//! tracking, and an offline delivery queue. The P2P overlay
//! (`concord-p2p`) can run alongside the HTTP listener.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod jwt;
pub mod oauth;
pub mod presence;
pub mod queue;
pub mod server;
pub mod services;
pub mod translate;
pub mod web;
pub mod ws;
