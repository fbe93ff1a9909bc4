//! Cryptographic primitives shared by the mixnet crates.
//!
//! Key exchange types come from `crypto_box` (x25519). Per-packet key
//! material is derived with BLAKE3 from the hop session key and the
//! per-packet seed carried in the packet header. The delay VRF lives in
//! the [`vrf`] module.

use crypto_box::aead::generic_array::typenum::marker_traits::Unsigned;
use crypto_box::aead::AeadCore;
use crypto_box::SalsaBox;
use rand::{CryptoRng, Rng};
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::XSalsa20;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use crypto_box::{PublicKey, SecretKey, KEY_SIZE};

pub mod vrf;

/// Nonce used by `SalsaBox` and `XSalsa20`.
pub type Nonce = [u8; NONCEBYTES];
/// Size of [`Nonce`] in bytes.
pub const NONCEBYTES: usize = <SalsaBox as AeadCore>::NonceSize::USIZE;

/// Size of a hop session key in bytes.
pub const SESSION_KEY_SIZE: usize = 32;

/// Size of the per-packet seed in bytes.
pub const SEED_SIZE: usize = 16;

/// Size of the per-hop header MAC in bytes.
pub const MAC_SIZE: usize = 16;

const PACKET_BASE_CONTEXT: &str = "mixnet v1 per-packet key base";
const HEADER_STREAM_LABEL: &[u8] = b"header stream";
const PAYLOAD_STREAM_LABEL: &[u8] = b"payload stream";
const HEADER_MAC_LABEL: &[u8] = b"header mac";

/// Symmetric session key shared between the circuit owner and one hop.
///
/// Established during circuit construction and erased from memory when
/// the circuit is destroyed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Generate a random session key.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> SessionKey {
        let mut bytes = [0; SESSION_KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        SessionKey(bytes)
    }

    /// Create a `SessionKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> SessionKey {
        SessionKey(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // key material never hits the logs
        f.write_str("SessionKey(..)")
    }
}

/// Key and nonce for one XSalsa20 keystream.
#[derive(Clone)]
pub struct StreamKey {
    /// XSalsa20 key.
    pub key: [u8; 32],
    /// XSalsa20 nonce.
    pub nonce: [u8; NONCEBYTES],
}

impl StreamKey {
    /// XOR the keystream into `buf` in place.
    pub fn apply(&self, buf: &mut [u8]) {
        let mut cipher = XSalsa20::new(&self.key.into(), &self.nonce.into());
        cipher.apply_keystream(buf);
    }

    /// Produce `len` bytes of raw keystream.
    pub fn keystream(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.apply(&mut buf);
        buf
    }
}

/// Per-packet key material for one hop, derived from the hop session
/// key and the per-packet seed.
pub struct PacketKeys {
    /// Keystream for the routing header.
    pub header: StreamKey,
    /// Keystream for the payload.
    pub payload: StreamKey,
    /// Key for the header MAC.
    pub mac_key: [u8; 32],
}

/// Derive the per-packet keys for one hop.
///
/// The derivation is deterministic so the circuit owner (who picks all
/// seeds) can reproduce the keystreams of every hop on the path.
pub fn packet_keys(session_key: &SessionKey, seed: &[u8; SEED_SIZE]) -> PacketKeys {
    let base_key = blake3::derive_key(PACKET_BASE_CONTEXT, session_key.as_bytes());
    let base = blake3::keyed_hash(&base_key, seed);

    PacketKeys {
        header: expand_stream(base.as_bytes(), HEADER_STREAM_LABEL),
        payload: expand_stream(base.as_bytes(), PAYLOAD_STREAM_LABEL),
        mac_key: *blake3::keyed_hash(base.as_bytes(), HEADER_MAC_LABEL).as_bytes(),
    }
}

fn expand_stream(base: &[u8; 32], label: &[u8]) -> StreamKey {
    let mut out = [0; 32 + NONCEBYTES];
    blake3::Hasher::new_keyed(base)
        .update(label)
        .finalize_xof()
        .fill(&mut out);
    let mut key = [0; 32];
    key.copy_from_slice(&out[..32]);
    let mut nonce = [0; NONCEBYTES];
    nonce.copy_from_slice(&out[32..]);
    StreamKey { key, nonce }
}

/// Compute the truncated header MAC over the routing header.
pub fn header_mac(mac_key: &[u8; 32], header: &[u8]) -> [u8; MAC_SIZE] {
    let hash = blake3::keyed_hash(mac_key, header);
    let mut mac = [0; MAC_SIZE];
    mac.copy_from_slice(&hash.as_bytes()[..MAC_SIZE]);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn packet_keys_deterministic() {
        let session_key = SessionKey::generate(&mut thread_rng());
        let seed = [42; SEED_SIZE];
        let keys_1 = packet_keys(&session_key, &seed);
        let keys_2 = packet_keys(&session_key, &seed);
        assert_eq!(keys_1.header.key, keys_2.header.key);
        assert_eq!(keys_1.header.nonce, keys_2.header.nonce);
        assert_eq!(keys_1.payload.key, keys_2.payload.key);
        assert_eq!(keys_1.mac_key, keys_2.mac_key);
    }

    #[test]
    fn packet_keys_differ_per_seed() {
        let session_key = SessionKey::generate(&mut thread_rng());
        let keys_1 = packet_keys(&session_key, &[1; SEED_SIZE]);
        let keys_2 = packet_keys(&session_key, &[2; SEED_SIZE]);
        assert_ne!(keys_1.header.key, keys_2.header.key);
        assert_ne!(keys_1.payload.key, keys_2.payload.key);
        assert_ne!(keys_1.mac_key, keys_2.mac_key);
    }

    #[test]
    fn stream_purposes_are_independent() {
        let session_key = SessionKey::generate(&mut thread_rng());
        let keys = packet_keys(&session_key, &[7; SEED_SIZE]);
        assert_ne!(keys.header.key, keys.payload.key);
    }

    #[test]
    fn stream_apply_roundtrip() {
        let session_key = SessionKey::generate(&mut thread_rng());
        let keys = packet_keys(&session_key, &[7; SEED_SIZE]);
        let mut buf = [42; 128];
        keys.header.apply(&mut buf);
        assert_ne!(buf, [42; 128]);
        keys.header.apply(&mut buf);
        assert_eq!(buf, [42; 128]);
    }

    #[test]
    fn keystream_matches_apply() {
        let session_key = SessionKey::generate(&mut thread_rng());
        let keys = packet_keys(&session_key, &[7; SEED_SIZE]);
        let stream = keys.payload.keystream(64);
        let mut buf = [0; 64];
        keys.payload.apply(&mut buf);
        assert_eq!(stream, buf);
    }

    #[test]
    fn header_mac_depends_on_content() {
        let mac_key = [3; 32];
        let mac_1 = header_mac(&mac_key, &[1, 2, 3]);
        let mac_2 = header_mac(&mac_key, &[1, 2, 4]);
        assert_ne!(mac_1, mac_2);
    }
}
