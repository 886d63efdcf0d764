//! Authenticated request envelopes and replay protection.
//!
//! Every peer-to-peer message travels as a [`SignedEnvelope`]:
//! `{sender_pubkey, nonce, timestamp, payload, signature}` where the
//! signature covers `sha256(nonce || timestamp || payload)`. The receiver
//! rejects envelopes with bad signatures, timestamps outside the
//! `nonce_ttl_s` window, or a `(sender, nonce)` pair already seen within
//! that window — the [`ReplayGuard`] remembers recent pairs in a bounded
//! cache, evicting oldest-first.

use std::collections::{HashMap, VecDeque};

use xai_core::codec::{Encodable, Reader, Writer};
use xai_core::constants::{PUBKEY_BYTES, SIGNATURE_BYTES};
use xai_core::crypto::{self, KeyPair, PublicKey};
use xai_core::error::{CodecError, NetworkError};
use xai_core::types::Hash256;

/// A signed peer-to-peer message wrapper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedEnvelope {
    /// Compressed secp256k1 key identifying the sender.
    pub sender_pubkey: [u8; PUBKEY_BYTES],
    /// One-shot value; never reused by a sender within the TTL window.
    pub nonce: u64,
    /// Sender's Unix time in seconds when the envelope was sealed.
    pub timestamp: u64,
    /// Canonical bytes of the enclosed [`Message`](crate::protocol::Message).
    pub payload: Vec<u8>,
    /// Compact signature over [`signing_digest`].
    pub signature: [u8; SIGNATURE_BYTES],
}

/// The digest an envelope signature commits to:
/// `sha256(nonce_le || timestamp_le || payload)`.
pub fn signing_digest(nonce: u64, timestamp: u64, payload: &[u8]) -> Hash256 {
    let mut data = Vec::with_capacity(16 + payload.len());
    data.extend_from_slice(&nonce.to_le_bytes());
    data.extend_from_slice(&timestamp.to_le_bytes());
    data.extend_from_slice(payload);
    Hash256(crypto::sha256(&data))
}

impl SignedEnvelope {
    /// Seal a payload under the sender's key.
    pub fn seal(keypair: &KeyPair, nonce: u64, timestamp: u64, payload: Vec<u8>) -> Self {
        let digest = signing_digest(nonce, timestamp, &payload);
        Self {
            sender_pubkey: keypair.public_key().to_bytes(),
            nonce,
            timestamp,
            signature: keypair.sign(&digest),
            payload,
        }
    }

    /// Verify the signature, returning the sender's parsed key.
    pub fn verify(&self) -> Result<PublicKey, NetworkError> {
        let pubkey = PublicKey::from_bytes(&self.sender_pubkey)
            .map_err(|_| NetworkError::InvalidEnvelopeSignature)?;
        let digest = signing_digest(self.nonce, self.timestamp, &self.payload);
        pubkey
            .verify(&digest, &self.signature)
            .map_err(|_| NetworkError::InvalidEnvelopeSignature)?;
        Ok(pubkey)
    }

    /// SHA-256 fingerprint of the sender key — the peer identifier.
    pub fn sender_fingerprint(&self) -> Hash256 {
        Hash256(crypto::sha256(&self.sender_pubkey))
    }
}

impl Encodable for SignedEnvelope {
    fn encode_into(&self, w: &mut Writer) {
        w.put_raw(&self.sender_pubkey);
        w.put_u64(self.nonce);
        w.put_u64(self.timestamp);
        w.put_var_bytes(&self.payload);
        w.put_raw(&self.signature);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            sender_pubkey: r.get_array::<PUBKEY_BYTES>()?,
            nonce: r.get_u64()?,
            timestamp: r.get_u64()?,
            payload: r.get_var_bytes()?,
            signature: r.get_array::<SIGNATURE_BYTES>()?,
        })
    }
}

/// Bounded cache of recently-seen `(sender, nonce)` pairs.
pub struct ReplayGuard {
    ttl_s: u64,
    max_entries: usize,
    /// `(sender_pubkey, nonce)` → time first seen.
    seen: HashMap<([u8; PUBKEY_BYTES], u64), u64>,
    /// Insertion order for oldest-first eviction.
    order: VecDeque<([u8; PUBKEY_BYTES], u64)>,
}

impl ReplayGuard {
    pub fn new(ttl_s: u64, max_entries: usize) -> Self {
        Self { ttl_s, max_entries, seen: HashMap::new(), order: VecDeque::new() }
    }

    /// Admit an envelope: the timestamp must be within ±ttl of `now`, and
    /// its `(sender, nonce)` must not have been seen within the window.
    pub fn check_and_record(
        &mut self,
        envelope: &SignedEnvelope,
        now: u64,
    ) -> Result<(), NetworkError> {
        let age = now.abs_diff(envelope.timestamp);
        if age > self.ttl_s {
            return Err(NetworkError::StaleEnvelope);
        }

        self.prune(now);

        let key = (envelope.sender_pubkey, envelope.nonce);
        if self.seen.contains_key(&key) {
            return Err(NetworkError::ReplayedNonce);
        }

        while self.seen.len() >= self.max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }

        self.seen.insert(key, now);
        self.order.push_back(key);
        Ok(())
    }

    /// Drop entries whose window has passed.
    fn prune(&mut self, now: u64) {
        while let Some(front) = self.order.front() {
            match self.seen.get(front) {
                Some(&seen_at) if now.saturating_sub(seen_at) > self.ttl_s => {
                    self.seen.remove(front);
                    self.order.pop_front();
                }
                Some(_) => break,
                None => {
                    self.order.pop_front();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: u64 = 120;

    fn keypair(seed: u8) -> KeyPair {
        KeyPair::from_secret_bytes(&[seed; 32]).unwrap()
    }

    #[test]
    fn seal_verify_round_trip() {
        let kp = keypair(1);
        let env = SignedEnvelope::seal(&kp, 17, 1_000, b"payload".to_vec());
        let pk = env.verify().unwrap();
        assert_eq!(pk.to_bytes(), kp.public_key().to_bytes());
        assert_eq!(env.sender_fingerprint(), kp.public_key().fingerprint());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let kp = keypair(1);
        let mut env = SignedEnvelope::seal(&kp, 17, 1_000, b"payload".to_vec());
        env.payload[0] ^= 1;
        assert!(matches!(env.verify(), Err(NetworkError::InvalidEnvelopeSignature)));
    }

    #[test]
    fn tampered_nonce_fails_verification() {
        let kp = keypair(1);
        let mut env = SignedEnvelope::seal(&kp, 17, 1_000, b"payload".to_vec());
        env.nonce += 1;
        assert!(env.verify().is_err());
    }

    #[test]
    fn canonical_round_trip() {
        let kp = keypair(2);
        let env = SignedEnvelope::seal(&kp, 99, 5_000, vec![1, 2, 3]);
        let bytes = env.encode();
        let decoded = SignedEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn replay_within_ttl_rejected() {
        let kp = keypair(1);
        let mut guard = ReplayGuard::new(TTL, 1024);
        let env = SignedEnvelope::seal(&kp, 17, 1_000, b"m".to_vec());

        guard.check_and_record(&env, 1_000).unwrap();
        // Identical envelope ten seconds later: replay.
        assert_eq!(guard.check_and_record(&env, 1_010), Err(NetworkError::ReplayedNonce));
    }

    #[test]
    fn same_nonce_different_sender_allowed() {
        let mut guard = ReplayGuard::new(TTL, 1024);
        let a = SignedEnvelope::seal(&keypair(1), 17, 1_000, b"m".to_vec());
        let b = SignedEnvelope::seal(&keypair(2), 17, 1_000, b"m".to_vec());
        guard.check_and_record(&a, 1_000).unwrap();
        guard.check_and_record(&b, 1_000).unwrap();
    }

    #[test]
    fn stale_timestamp_rejected_both_directions() {
        let kp = keypair(1);
        let mut guard = ReplayGuard::new(TTL, 1024);

        let old = SignedEnvelope::seal(&kp, 1, 1_000, b"m".to_vec());
        assert_eq!(
            guard.check_and_record(&old, 1_000 + TTL + 1),
            Err(NetworkError::StaleEnvelope)
        );

        let future = SignedEnvelope::seal(&kp, 2, 2_000 + TTL + 1, b"m".to_vec());
        assert_eq!(guard.check_and_record(&future, 2_000), Err(NetworkError::StaleEnvelope));
    }

    #[test]
    fn boundary_timestamp_accepted() {
        let kp = keypair(1);
        let mut guard = ReplayGuard::new(TTL, 1024);
        let env = SignedEnvelope::seal(&kp, 1, 1_000, b"m".to_vec());
        // Exactly at the window edge.
        guard.check_and_record(&env, 1_000 + TTL).unwrap();
    }

    #[test]
    fn nonce_reusable_after_window_passes() {
        let kp = keypair(1);
        let mut guard = ReplayGuard::new(TTL, 1024);
        let env = SignedEnvelope::seal(&kp, 17, 1_000, b"m".to_vec());
        guard.check_and_record(&env, 1_000).unwrap();

        // Well past the TTL, the pair has been pruned; a fresh envelope with
        // the same nonce (and an in-window timestamp) is admissible.
        let later = SignedEnvelope::seal(&kp, 17, 2_000, b"m".to_vec());
        guard.check_and_record(&later, 2_000).unwrap();
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let kp = keypair(1);
        let mut guard = ReplayGuard::new(TTL, 2);
        for nonce in 0..3u64 {
            let env = SignedEnvelope::seal(&kp, nonce, 1_000, b"m".to_vec());
            guard.check_and_record(&env, 1_000).unwrap();
        }
        assert_eq!(guard.len(), 2);

        // Nonce 0 was evicted; nonce 2 is still guarded.
        let replay = SignedEnvelope::seal(&kp, 2, 1_000, b"m".to_vec());
        assert_eq!(guard.check_and_record(&replay, 1_001), Err(NetworkError::ReplayedNonce));
    }
}
