//! Per-peer end-to-end encryption sessions.
//!
//! Each host owns one long-term X25519 key pair. Exchanging public keys
//! with a peer derives a symmetric session key:
//!
//! ```text
//! shared = X25519(our_secret, their_public)
//! key    = HKDF-SHA256(salt = empty, ikm = shared, info = "concord-e2ee-v1")
//! ```
//!
//! Payloads are sealed with AES-256-GCM under that key; the 12-byte random
//! nonce is prepended to the ciphertext. A session key, once derived, is
//! constant — rotation is remove + re-add. Keys live only in memory.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use parking_lot::RwLock;
use x25519_dalek::{PublicKey, StaticSecret};

/// HKDF context string. Changing it changes every derived key.
const HKDF_INFO: &[u8] = b"concord-e2ee-v1";

/// AES-GCM nonce length in bytes.
const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum E2eeError {
    #[error("no session key for peer")]
    NoSessionKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("key derivation failed")]
    KdfFailed,
}

/// Manages the local key pair and one derived session key per peer.
///
/// Reads (encrypt/decrypt) take a shared lock; key addition and removal
/// take the exclusive lock.
pub struct E2eeManager {
    secret: StaticSecret,
    public: PublicKey,
    sessions: RwLock<HashMap<String, [u8; 32]>>,
}

impl E2eeManager {
    /// Create a manager with a fresh X25519 key pair.
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Restore a manager from a persisted 32-byte secret.
    pub fn from_secret(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Our public key half, for distribution to peers.
    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Derive and store the session key for `peer_id`. Re-adding the same
    /// peer overwrites the previous key.
    pub fn add_peer_key(&self, peer_id: &str, their_public: [u8; 32]) -> Result<(), E2eeError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(their_public));
        let hk = hkdf::Hkdf::<sha2::Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|_| E2eeError::KdfFailed)?;
        self.sessions.write().insert(peer_id.to_string(), key);
        Ok(())
    }

    /// Seal `plaintext` for `peer_id`. Returns `nonce || ciphertext`.
    pub fn encrypt(&self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, E2eeError> {
        let sessions = self.sessions.read();
        let key = sessions.get(peer_id).ok_or(E2eeError::NoSessionKey)?;
        let cipher = Aes256Gcm::new(key.into());
        let nonce_bytes: [u8; NONCE_SIZE] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ct = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| E2eeError::EncryptionFailed)?;
        let mut blob = Vec::with_capacity(NONCE_SIZE + ct.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ct);
        Ok(blob)
    }

    /// Open a `nonce || ciphertext` blob from `peer_id`.
    ///
    /// All AEAD failures collapse to [`E2eeError::DecryptionFailed`] so the
    /// caller learns nothing about why the blob was rejected.
    pub fn decrypt(&self, peer_id: &str, blob: &[u8]) -> Result<Vec<u8>, E2eeError> {
        if blob.len() < NONCE_SIZE {
            return Err(E2eeError::DecryptionFailed);
        }
        let sessions = self.sessions.read();
        let key = sessions.get(peer_id).ok_or(E2eeError::NoSessionKey)?;
        let cipher = Aes256Gcm::new(key.into());
        let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
        cipher
            .decrypt(nonce, &blob[NONCE_SIZE..])
            .map_err(|_| E2eeError::DecryptionFailed)
    }

    pub fn remove_peer(&self, peer_id: &str) {
        self.sessions.write().remove(peer_id);
    }

    pub fn has_session_key(&self, peer_id: &str) -> bool {
        self.sessions.read().contains_key(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for E2eeManager {
    fn default() -> Self {
        Self::new()
    }
}
