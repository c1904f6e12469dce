//! Secure channel codec for control messages
//!
//! Messages between the coordinator and a machine are JSON sealed with
//! authenticated public-key encryption: an X25519 agreement between our
//! private key and the peer's public key, hashed into an XChaCha20-Poly1305
//! key. Every sealed message is `nonce (24 bytes) || ciphertext || tag`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use x25519_dalek::PublicKey;

use crate::keys::{MachinePrivate, MachinePublic};
use crate::{Error, Result};

/// Nonce length for XChaCha20-Poly1305
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

const KDF_LABEL: &[u8] = b"meshgate control channel v1";

/// Derive the symmetric box key shared by `own` and `peer`.
///
/// Returns `None` when the peer key is a low-order point.
fn box_key(peer: &MachinePublic, own: &MachinePrivate) -> Option<Key> {
    let shared = own
        .secret()
        .diffie_hellman(&PublicKey::from(*peer.as_bytes()));
    if !shared.was_contributory() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(KDF_LABEL);
    hasher.update(shared.as_bytes());
    Some(Key::clone_from_slice(&hasher.finalize()))
}

/// Seal raw bytes to `peer`.
pub fn seal(plaintext: &[u8], peer: &MachinePublic, own: &MachinePrivate) -> Result<Vec<u8>> {
    let key = box_key(peer, own).ok_or_else(|| Error::MalformedKey {
        kind: "machine key",
        reason: "low-order public key".to_string(),
    })?;
    let cipher = XChaCha20Poly1305::new(&key);

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::DecryptionFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open bytes sealed by `peer`.
pub fn open(sealed: &[u8], peer: &MachinePublic, own: &MachinePrivate) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        debug!(length = sealed.len(), "Sealed message too short");
        return Err(Error::DecryptionFailed);
    }
    let key = box_key(peer, own).ok_or(Error::DecryptionFailed)?;
    let cipher = XChaCha20Poly1305::new(&key);

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| {
            debug!(length = sealed.len(), "Failed to authenticate sealed message");
            Error::DecryptionFailed
        })
}

/// Serialize `value` to JSON and seal it to `peer`.
pub fn encode<T: Serialize + ?Sized>(
    value: &T,
    peer: &MachinePublic,
    own: &MachinePrivate,
) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    seal(&json, peer, own)
}

/// Open a message from `peer` and parse its JSON body.
pub fn decode<T: DeserializeOwned>(
    msg: &[u8],
    peer: &MachinePublic,
    own: &MachinePrivate,
) -> Result<T> {
    debug!(length = msg.len(), "Trying to decrypt");
    let plaintext = open(msg, peer, own)?;
    serde_json::from_slice(&plaintext).map_err(|e| Error::MalformedPayload(e.to_string()))
}
