//! Core protocol types: transactions, blocks, UTXOs.
//!
//! All monetary values are micro-units (1 XAI = 10^6 µu). Object identities
//! (txid, block hash) are double SHA-256 over the canonical encoding from
//! [`codec`](crate::codec), never over any in-memory or text representation.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::address::Address;
use crate::codec::{Encodable, Reader, Writer};
use crate::constants::{PUBKEY_BYTES, SIGNATURE_BYTES};
use crate::crypto::sha256d;
use crate::error::CodecError;

/// A 32-byte hash value: txids, block hashes, merkle roots, fingerprints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used as the genesis parent pointer.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(s).map_err(|_| CodecError::InvalidUtf8)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CodecError::UnexpectedEof(0))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Hash256 {
    type Err = CodecError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl Encodable for Hash256 {
    fn encode_into(&self, w: &mut Writer) {
        w.put_raw(&self.0);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self(r.get_array::<32>()?))
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within that transaction.
    pub vout: u32,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl Encodable for OutPoint {
    fn encode_into(&self, w: &mut Writer) {
        self.txid.encode_into(w);
        w.put_u32(self.vout);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self { txid: Hash256::decode_from(r)?, vout: r.get_u32()? })
    }
}

/// A transaction output, creating a new UTXO.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    /// Recipient address.
    pub address: Address,
    /// Value in micro-units. Must be positive.
    pub amount: u64,
}

impl Encodable for TxOutput {
    fn encode_into(&self, w: &mut Writer) {
        self.address.encode_into(w);
        w.put_u64(self.amount);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self { address: Address::decode_from(r)?, amount: r.get_u64()? })
    }
}

/// A transaction transferring value between accounts.
///
/// Regular transactions carry a single sender-level signature over the txid
/// and a monotonic per-sender nonce. The coinbase has no inputs and is exempt
/// from signature, nonce, and fee rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Protocol version.
    pub version: u32,
    /// Previous outputs being spent. Empty for the coinbase.
    pub inputs: Vec<OutPoint>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height before which this tx is invalid (0 = always valid).
    pub locktime: u64,
    /// Sender address; must derive from `sender_pubkey`.
    pub sender: Address,
    /// Compressed secp256k1 public key. Zeroed for the coinbase.
    pub sender_pubkey: [u8; PUBKEY_BYTES],
    /// Compact ECDSA signature over the txid. Zeroed for the coinbase.
    pub signature: [u8; SIGNATURE_BYTES],
    /// Monotonic per-sender counter. The coinbase reuses it for the height.
    pub nonce: u64,
    /// Declared fee in micro-units.
    pub fee: u64,
    /// Optional memo, bounded by MAX_MEMO_BYTES. The coinbase uses it as
    /// the miner's extra-nonce.
    pub memo: Option<String>,
    /// Txid of the mempool transaction this one replaces (RBF), if any.
    pub replaces_txid: Option<Hash256>,
    /// Whether this transaction opts into replace-by-fee.
    pub rbf: bool,
}

impl Transaction {
    /// Write the canonical encoding. With `zero_signature`, the signature
    /// field is written as 64 zero bytes — the form the txid commits to.
    fn encode_canonical(&self, w: &mut Writer, zero_signature: bool) {
        w.put_u32(self.version);
        w.put_vec(&self.inputs);
        w.put_vec(&self.outputs);
        w.put_u64(self.locktime);
        self.sender.encode_into(w);
        w.put_raw(&self.sender_pubkey);
        if zero_signature {
            w.put_raw(&[0u8; SIGNATURE_BYTES]);
        } else {
            w.put_raw(&self.signature);
        }
        w.put_u64(self.nonce);
        w.put_u64(self.fee);
        w.put_option(&self.memo);
        w.put_option(&self.replaces_txid);
        w.put_bool(self.rbf);
    }

    /// The transaction ID: double SHA-256 of the canonical encoding with the
    /// signature zeroed. Stable under signing.
    pub fn txid(&self) -> Hash256 {
        let mut w = Writer::with_capacity(256);
        self.encode_canonical(&mut w, true);
        sha256d(&w.into_bytes())
    }

    /// Whether this is a coinbase transaction (no inputs).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Sum of all output amounts. `None` on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs.iter().try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }
}

impl Encodable for Transaction {
    fn encode_into(&self, w: &mut Writer) {
        self.encode_canonical(w, false);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: r.get_u32()?,
            inputs: r.get_vec()?,
            outputs: r.get_vec()?,
            locktime: r.get_u64()?,
            sender: Address::decode_from(r)?,
            sender_pubkey: r.get_array::<PUBKEY_BYTES>()?,
            signature: r.get_array::<SIGNATURE_BYTES>()?,
            nonce: r.get_u64()?,
            fee: r.get_u64()?,
            memo: r.get_option()?,
            replaces_txid: r.get_option()?,
            rbf: r.get_bool()?,
        })
    }
}

/// Block header containing the proof-of-work puzzle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u32,
    /// Height of this block; parent height + 1.
    pub height: u64,
    /// Hash of the parent block header.
    pub prev_hash: Hash256,
    /// Merkle root over the block's txids, in order.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Compact encoding of the 256-bit difficulty target.
    pub difficulty_bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u64,
    /// Address credited by the coinbase.
    pub miner: Address,
}

impl BlockHeader {
    /// The block hash: double SHA-256 of the canonical header encoding.
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.encode())
    }
}

impl Encodable for BlockHeader {
    fn encode_into(&self, w: &mut Writer) {
        w.put_u32(self.version);
        w.put_u64(self.height);
        self.prev_hash.encode_into(w);
        self.merkle_root.encode_into(w);
        w.put_u64(self.timestamp);
        w.put_u32(self.difficulty_bits);
        w.put_u64(self.nonce);
        self.miner.encode_into(w);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: r.get_u32()?,
            height: r.get_u64()?,
            prev_hash: Hash256::decode_from(r)?,
            merkle_root: Hash256::decode_from(r)?,
            timestamp: r.get_u64()?,
            difficulty_bits: r.get_u32()?,
            nonce: r.get_u64()?,
            miner: Address::decode_from(r)?,
        })
    }
}

/// A complete block: header plus transactions, coinbase first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The block hash (hash of the header).
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// The coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }
}

impl Encodable for Block {
    fn encode_into(&self, w: &mut Writer) {
        self.header.encode_into(w);
        w.put_vec(&self.transactions);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self { header: BlockHeader::decode_from(r)?, transactions: r.get_vec()? })
    }
}

/// An entry in the unspent transaction output set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoEntry {
    /// Owner of the output.
    pub address: Address,
    /// Value in micro-units.
    pub amount: u64,
    /// Height of the block that created this output.
    pub height: u64,
    /// Whether the output came from a coinbase transaction.
    pub coinbase: bool,
}

impl UtxoEntry {
    /// Whether this output may be spent at `current_height`.
    ///
    /// Coinbase outputs require `maturity` confirmations; everything else is
    /// always spendable.
    pub fn is_mature(&self, current_height: u64, maturity: u64) -> bool {
        if !self.coinbase {
            return true;
        }
        current_height.saturating_sub(self.height) >= maturity
    }
}

impl Encodable for UtxoEntry {
    fn encode_into(&self, w: &mut Writer) {
        self.address.encode_into(w);
        w.put_u64(self.amount);
        w.put_u64(self.height);
        w.put_bool(self.coinbase);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            address: Address::decode_from(r)?,
            amount: r.get_u64()?,
            height: r.get_u64()?,
            coinbase: r.get_bool()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;
    use crate::constants::COIN;

    fn addr(seed: u8) -> Address {
        Address::from_hash160([seed; 20], Network::Regtest)
    }

    pub(crate) fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![OutPoint { txid: Hash256([0x11; 32]), vout: 0 }],
            outputs: vec![TxOutput { address: addr(0xAA), amount: 50 * COIN }],
            locktime: 0,
            sender: addr(0xBB),
            sender_pubkey: [2u8; 33],
            signature: [3u8; 64],
            nonce: 1,
            fee: 1_000,
            memo: None,
            replaces_txid: None,
            rbf: false,
        }
    }

    fn sample_coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput { address: addr(0xAA), amount: 60 * COIN }],
            locktime: 0,
            sender: addr(0xAA),
            sender_pubkey: [0u8; 33],
            signature: [0u8; 64],
            nonce: 7,
            fee: 0,
            memo: Some("extra".into()),
            replaces_txid: None,
            rbf: false,
        }
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            height: 7,
            prev_hash: Hash256([0x42; 32]),
            merkle_root: Hash256([0x43; 32]),
            timestamp: 1_700_000_000,
            difficulty_bits: 0x207f_ffff,
            nonce: 99,
            miner: addr(0xAA),
        }
    }

    // --- Hash256 ---

    #[test]
    fn hash256_hex_round_trip() {
        let h = Hash256([0xAB; 32]);
        let s = h.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(Hash256::from_hex(&s).unwrap(), h);
    }

    #[test]
    fn hash256_bad_hex_rejected() {
        assert!(Hash256::from_hex("zz").is_err());
        assert!(Hash256::from_hex("ab").is_err()); // too short
    }

    #[test]
    fn hash256_serde_as_hex_string() {
        let h = Hash256([0x01; 32]);
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.starts_with("\"01"));
        let back: Hash256 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    // --- Transaction identity ---

    #[test]
    fn txid_ignores_signature() {
        let tx = sample_tx();
        let mut signed = tx.clone();
        signed.signature = [0xFF; 64];
        assert_eq!(tx.txid(), signed.txid());
    }

    #[test]
    fn txid_commits_to_nonce_and_fee() {
        let tx = sample_tx();
        let mut other = tx.clone();
        other.nonce += 1;
        assert_ne!(tx.txid(), other.txid());
        let mut other = tx.clone();
        other.fee += 1;
        assert_ne!(tx.txid(), other.txid());
    }

    #[test]
    fn txid_commits_to_rbf_fields() {
        let tx = sample_tx();
        let mut other = tx.clone();
        other.rbf = true;
        assert_ne!(tx.txid(), other.txid());
        let mut other = tx.clone();
        other.replaces_txid = Some(Hash256([9; 32]));
        assert_ne!(tx.txid(), other.txid());
    }

    #[test]
    fn coinbase_detection() {
        assert!(sample_coinbase().is_coinbase());
        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn total_output_value_overflow_is_none() {
        let mut tx = sample_tx();
        tx.outputs = vec![
            TxOutput { address: addr(1), amount: u64::MAX },
            TxOutput { address: addr(2), amount: 1 },
        ];
        assert_eq!(tx.total_output_value(), None);
    }

    // --- Canonical round-trips ---

    #[test]
    fn transaction_round_trip() {
        for tx in [sample_tx(), sample_coinbase()] {
            let bytes = tx.encode();
            let decoded = Transaction::decode(&bytes).unwrap();
            assert_eq!(decoded, tx);
            assert_eq!(decoded.encode(), bytes);
        }
    }

    #[test]
    fn header_round_trip_and_hash_stability() {
        let h = sample_header();
        let bytes = h.encode();
        let decoded = BlockHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.hash(), h.hash());
    }

    #[test]
    fn block_round_trip() {
        let block = Block {
            header: sample_header(),
            transactions: vec![sample_coinbase(), sample_tx()],
        };
        let bytes = block.encode();
        let decoded = Block::decode(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn utxo_entry_round_trip() {
        let entry = UtxoEntry { address: addr(0xCC), amount: 12_345, height: 101, coinbase: true };
        assert_eq!(UtxoEntry::decode(&entry.encode()).unwrap(), entry);
    }

    #[test]
    fn block_hash_changes_with_nonce() {
        let h1 = sample_header();
        let mut h2 = h1.clone();
        h2.nonce += 1;
        assert_ne!(h1.hash(), h2.hash());
    }

    #[test]
    fn truncated_block_rejected() {
        let block = Block { header: sample_header(), transactions: vec![sample_coinbase()] };
        let bytes = block.encode();
        assert!(Block::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    // --- Maturity ---

    #[test]
    fn coinbase_maturity_boundary() {
        let entry = UtxoEntry { address: addr(1), amount: 1, height: 100, coinbase: true };
        assert!(!entry.is_mature(199, 100));
        assert!(entry.is_mature(200, 100));
    }

    #[test]
    fn regular_output_always_mature() {
        let entry = UtxoEntry { address: addr(1), amount: 1, height: 100, coinbase: false };
        assert!(entry.is_mature(0, 100));
    }
}
