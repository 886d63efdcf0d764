//! secp256k1 cryptographic operations for the XAI protocol.
//!
//! Provides key generation, transaction signing, and signature verification,
//! plus the SHA-256 / RIPEMD-160 hash primitives every other module builds on.
//!
//! # Signing scheme
//!
//! A transaction carries a single sender-level signature over its txid, which
//! is the double SHA-256 of the canonical encoding with the signature field
//! zeroed. Signatures are deterministic (RFC 6979) compact 64-byte ECDSA;
//! verification accepts only the low-S form, so a relayed transaction cannot
//! be malleated into a different txid.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, SECP256K1, SecretKey};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

use crate::constants::{PUBKEY_BYTES, SIGNATURE_BYTES};
use crate::error::CryptoError;
use crate::types::{Hash256, Transaction};

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Double SHA-256 of `data`, the protocol's object-identity hash.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// RIPEMD-160 of SHA-256, the address payload hash.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    use ripemd::Ripemd160;
    Ripemd160::digest(Sha256::digest(data)).into()
}

/// secp256k1 keypair for signing transactions and peer envelopes.
///
/// Use [`KeyPair::generate`] for random keys or
/// [`KeyPair::from_secret_bytes`] for deterministic derivation from stored
/// key material.
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        Self { secret: SecretKey::new(&mut rand::thread_rng()) }
    }

    /// Create a keypair from 32-byte secret key material.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self { secret })
    }

    /// Derive the compressed public key for this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey { inner: secp256k1::PublicKey::from_secret_key(SECP256K1, &self.secret) }
    }

    /// Raw secret key bytes, zeroized when the returned guard drops.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.secret_bytes())
    }

    /// Sign a 32-byte message hash, returning the compact 64-byte signature.
    ///
    /// RFC 6979 deterministic nonces: the same key and message always yield
    /// the same signature. The result is already in low-S form.
    pub fn sign(&self, msg32: &Hash256) -> [u8; SIGNATURE_BYTES] {
        let msg = Message::from_digest(msg32.0);
        SECP256K1.sign_ecdsa(&msg, &self.secret).serialize_compact()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self { secret: self.secret }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Compressed secp256k1 public key for verifying signatures and deriving
/// addresses.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: secp256k1::PublicKey,
}

impl PublicKey {
    /// Parse a compressed 33-byte public key.
    pub fn from_bytes(bytes: &[u8; PUBKEY_BYTES]) -> Result<Self, CryptoError> {
        let inner =
            secp256k1::PublicKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { inner })
    }

    /// Compressed 33-byte serialization.
    pub fn to_bytes(&self) -> [u8; PUBKEY_BYTES] {
        self.inner.serialize()
    }

    /// RIPEMD-160(SHA-256(pubkey)) — the address payload.
    pub fn hash160(&self) -> [u8; 20] {
        hash160(&self.to_bytes())
    }

    /// SHA-256 fingerprint of the compressed key; the P2P peer identifier.
    pub fn fingerprint(&self) -> Hash256 {
        Hash256(sha256(&self.to_bytes()))
    }

    /// Verify a compact ECDSA signature over a 32-byte message hash.
    ///
    /// Malleable (high-S) signatures are rejected outright.
    pub fn verify(
        &self,
        msg32: &Hash256,
        signature: &[u8; SIGNATURE_BYTES],
    ) -> Result<(), CryptoError> {
        let sig = Signature::from_compact(signature).map_err(|_| CryptoError::InvalidSignature)?;
        let mut normalized = sig;
        normalized.normalize_s();
        if normalized != sig {
            return Err(CryptoError::VerificationFailed);
        }
        let msg = Message::from_digest(msg32.0);
        SECP256K1
            .verify_ecdsa(&msg, &sig, &self.inner)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// Sign a transaction in place: sets `sender_pubkey` and `signature`.
///
/// The txid excludes the signature field, so signing never changes the id.
pub fn sign_transaction(tx: &mut Transaction, keypair: &KeyPair) {
    tx.sender_pubkey = keypair.public_key().to_bytes();
    let txid = tx.txid();
    tx.signature = keypair.sign(&txid);
}

/// Verify a transaction's sender signature against its txid.
pub fn verify_transaction_signature(tx: &Transaction) -> Result<(), CryptoError> {
    let pubkey = PublicKey::from_bytes(&tx.sender_pubkey)?;
    pubkey.verify(&tx.txid(), &tx.signature)
}
