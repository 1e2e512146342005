//! Human-shareable room codes for WAN rendezvous.
//!
//! A code is derived deterministically from the host's peer id, so the same
//! host always advertises under the same code. Collisions need the first
//! four hash bytes to agree, which is fine for codes people read aloud.

use sha2::{Digest, Sha256};

/// Prefix every rendezvous string carries on the DHT.
pub const RENDEZVOUS_PREFIX: &str = "concord-room/";

const WORDS: &[&str] = &[
    "amber", "anchor", "aspen", "atlas", "badger", "bamboo", "basalt", "beacon",
    "birch", "bison", "bramble", "breeze", "canyon", "cedar", "cinder", "cobalt",
    "comet", "coral", "cosmos", "crane", "delta", "drift", "ember", "falcon",
    "fennel", "fjord", "flint", "gale", "garnet", "glacier", "granite", "grove",
    "harbor", "hazel", "heron", "hollow", "indigo", "iris", "jasper", "juniper",
    "kestrel", "lagoon", "lantern", "lichen", "linden", "lotus", "lunar", "maple",
    "marble", "meadow", "mesa", "mistral", "nettle", "north", "ocean", "onyx",
    "orchid", "osprey", "otter", "pebble", "pine", "plume", "prairie", "quartz",
    "raven", "reef", "ridge", "river", "rowan", "saffron", "sage", "sequoia",
    "shale", "sierra", "slate", "sparrow", "spruce", "summit", "sunder", "tamarin",
    "tempest", "thistle", "tide", "timber", "topaz", "tundra", "umber", "vale",
    "vesper", "walnut", "willow", "winter", "wren", "yarrow", "zephyr", "zenith",
];

/// Derive the room code for a peer id: `"<word>-<4 digits>"`.
pub fn room_code(peer_id: &str) -> String {
    let digest = Sha256::digest(peer_id.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let word = WORDS[(n as usize) % WORDS.len()];
    let number = (n >> 10) % 9000 + 1000;
    format!("{word}-{number}")
}

/// The DHT rendezvous string for a room code.
pub fn rendezvous_string(code: &str) -> String {
    format!("{RENDEZVOUS_PREFIX}{code}")
}
