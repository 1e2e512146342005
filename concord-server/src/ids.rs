//! Time-sortable entity ids.
//!
//! Every row (users, guilds, channels, messages, sessions) gets a ULID:
//! 48 bits of millisecond timestamp followed by 80 random bits, rendered as
//! 26 Crockford base32 characters. Lexicographic order equals creation
//! order, which is what cursor pagination relies on.

use rand::Rng;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate a fresh ULID.
pub fn new_id() -> String {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let mut rng = rand::thread_rng();
    let random: u128 = ((rng.gen::<u16>() as u128) << 64) | rng.gen::<u64>() as u128;

    let mut out = [0u8; 26];
    let mut ts = now_ms;
    for slot in out[..10].iter_mut().rev() {
        *slot = ALPHABET[(ts & 0x1F) as usize];
        ts >>= 5;
    }
    let mut r = random;
    for slot in out[10..].iter_mut().rev() {
        *slot = ALPHABET[(r & 0x1F) as usize];
        r >>= 5;
    }

    // All bytes come from the base32 alphabet.
    String::from_utf8(out.to_vec()).expect("ulid is ascii")
}
