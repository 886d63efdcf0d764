//! Wire message types and framing for the XAI P2P protocol.
//!
//! Every message is canonically encoded (tag byte + fields, §codec rules)
//! and travels inside a [`SignedEnvelope`](crate::envelope::SignedEnvelope).
//! Frames on the wire are `magic(4) || length(u32 LE) || envelope bytes`,
//! with the length bounded before any allocation. Never JSON for anything
//! consensus-adjacent.

use xai_core::codec::{Encodable, Reader, Writer};
use xai_core::difficulty::ChainWork;
use xai_core::error::{CodecError, NetworkError};
use xai_core::types::{Block, BlockHeader, Hash256, Transaction};

/// Most ids in one `inv` / `get_data` message.
pub const MAX_INV_ITEMS: usize = 2_000;

/// Most headers in one `headers` response.
pub const MAX_HEADERS_PER_MSG: usize = 2_000;

/// Frame overhead: magic + length word.
pub const FRAME_HEADER_BYTES: usize = 8;

/// Upper bound on a reject reason string.
pub const MAX_REJECT_REASON: usize = 256;

/// What a `get_data` entry refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvKind {
    Tx,
    Block,
}

/// One entry of a `get_data` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvItem {
    pub kind: InvKind,
    pub id: Hash256,
}

impl Encodable for InvItem {
    fn encode_into(&self, w: &mut Writer) {
        w.put_u8(match self.kind {
            InvKind::Tx => 0,
            InvKind::Block => 1,
        });
        self.id.encode_into(w);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let kind = match r.get_u8()? {
            0 => InvKind::Tx,
            1 => InvKind::Block,
            tag => return Err(CodecError::InvalidTag { what: "inv_kind", tag }),
        };
        Ok(Self { kind, id: Hash256::decode_from(r)? })
    }
}

/// Why an object was rejected, reported back to its sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectKind {
    Validation,
    Consensus,
    Conflict,
    RateLimit,
}

impl RejectKind {
    fn tag(self) -> u8 {
        match self {
            RejectKind::Validation => 0,
            RejectKind::Consensus => 1,
            RejectKind::Conflict => 2,
            RejectKind::RateLimit => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            0 => RejectKind::Validation,
            1 => RejectKind::Consensus,
            2 => RejectKind::Conflict,
            3 => RejectKind::RateLimit,
            _ => return Err(CodecError::InvalidTag { what: "reject_kind", tag }),
        })
    }
}

/// A network message exchanged between XAI peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Version and tip exchange on connect.
    Hello {
        version: u32,
        network_id: u8,
        best_tip_hash: Hash256,
        best_tip_height: u64,
        cumulative_work: ChainWork,
    },
    /// Liveness probe.
    Ping(u64),
    /// Liveness answer, echoing the ping nonce.
    Pong(u64),
    /// Request up to `count` headers following `from_hash`.
    GetHeaders { from_hash: Hash256, count: u32 },
    /// Ordered header chain answering `GetHeaders`.
    Headers(Vec<BlockHeader>),
    /// Request a full block by hash.
    GetBlock(Hash256),
    /// Full block answering `GetBlock`.
    BlockMsg(Block),
    /// Announce transactions by id.
    InvTx(Vec<Hash256>),
    /// Announce blocks by id.
    InvBlock(Vec<Hash256>),
    /// Request bodies for announced ids.
    GetData(Vec<InvItem>),
    /// A full transaction.
    Tx(Transaction),
    /// An object was rejected.
    Reject { id: Hash256, kind: RejectKind, reason: String },
}

impl Message {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetHeaders { .. } => "get_headers",
            Message::Headers(_) => "headers",
            Message::GetBlock(_) => "get_block",
            Message::BlockMsg(_) => "block",
            Message::InvTx(_) => "inv_tx",
            Message::InvBlock(_) => "inv_block",
            Message::GetData(_) => "get_data",
            Message::Tx(_) => "tx",
            Message::Reject { .. } => "reject",
        }
    }

    /// Enforce per-message bounds before encoding or after decoding.
    pub fn validate(&self) -> Result<(), NetworkError> {
        let too_many = |len: usize, max: usize| NetworkError::MessageTooLarge { size: len, max };
        match self {
            Message::Headers(headers) if headers.len() > MAX_HEADERS_PER_MSG => {
                Err(too_many(headers.len(), MAX_HEADERS_PER_MSG))
            }
            Message::InvTx(ids) | Message::InvBlock(ids) if ids.len() > MAX_INV_ITEMS => {
                Err(too_many(ids.len(), MAX_INV_ITEMS))
            }
            Message::GetData(items) if items.len() > MAX_INV_ITEMS => {
                Err(too_many(items.len(), MAX_INV_ITEMS))
            }
            Message::Reject { reason, .. } if reason.len() > MAX_REJECT_REASON => {
                Err(too_many(reason.len(), MAX_REJECT_REASON))
            }
            _ => Ok(()),
        }
    }
}

impl Encodable for Message {
    fn encode_into(&self, w: &mut Writer) {
        match self {
            Message::Hello { version, network_id, best_tip_hash, best_tip_height, cumulative_work } => {
                w.put_u8(0);
                w.put_u32(*version);
                w.put_u8(*network_id);
                best_tip_hash.encode_into(w);
                w.put_u64(*best_tip_height);
                cumulative_work.encode_into(w);
            }
            Message::Ping(nonce) => {
                w.put_u8(1);
                w.put_u64(*nonce);
            }
            Message::Pong(nonce) => {
                w.put_u8(2);
                w.put_u64(*nonce);
            }
            Message::GetHeaders { from_hash, count } => {
                w.put_u8(3);
                from_hash.encode_into(w);
                w.put_u32(*count);
            }
            Message::Headers(headers) => {
                w.put_u8(4);
                w.put_vec(headers);
            }
            Message::GetBlock(hash) => {
                w.put_u8(5);
                hash.encode_into(w);
            }
            Message::BlockMsg(block) => {
                w.put_u8(6);
                block.encode_into(w);
            }
            Message::InvTx(ids) => {
                w.put_u8(7);
                w.put_vec(ids);
            }
            Message::InvBlock(ids) => {
                w.put_u8(8);
                w.put_vec(ids);
            }
            Message::GetData(items) => {
                w.put_u8(9);
                w.put_vec(items);
            }
            Message::Tx(tx) => {
                w.put_u8(10);
                tx.encode_into(w);
            }
            Message::Reject { id, kind, reason } => {
                w.put_u8(11);
                id.encode_into(w);
                w.put_u8(kind.tag());
                w.put_string(reason);
            }
        }
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let tag = r.get_u8()?;
        Ok(match tag {
            0 => Message::Hello {
                version: r.get_u32()?,
                network_id: r.get_u8()?,
                best_tip_hash: Hash256::decode_from(r)?,
                best_tip_height: r.get_u64()?,
                cumulative_work: ChainWork::decode_from(r)?,
            },
            1 => Message::Ping(r.get_u64()?),
            2 => Message::Pong(r.get_u64()?),
            3 => Message::GetHeaders { from_hash: Hash256::decode_from(r)?, count: r.get_u32()? },
            4 => Message::Headers(r.get_vec()?),
            5 => Message::GetBlock(Hash256::decode_from(r)?),
            6 => Message::BlockMsg(Block::decode_from(r)?),
            7 => Message::InvTx(r.get_vec()?),
            8 => Message::InvBlock(r.get_vec()?),
            9 => Message::GetData(r.get_vec()?),
            10 => Message::Tx(Transaction::decode_from(r)?),
            11 => Message::Reject {
                id: Hash256::decode_from(r)?,
                kind: RejectKind::from_tag(r.get_u8()?)?,
                reason: r.get_string()?,
            },
            _ => return Err(CodecError::InvalidTag { what: "message", tag }),
        })
    }
}

/// Prepend the wire frame: `magic || length || payload`.
///
/// Fails if the framed size would exceed `max_frame_bytes`.
pub fn encode_frame(
    magic: [u8; 4],
    payload: &[u8],
    max_frame_bytes: usize,
) -> Result<Vec<u8>, NetworkError> {
    let total = FRAME_HEADER_BYTES + payload.len();
    if total > max_frame_bytes {
        return Err(NetworkError::MessageTooLarge { size: total, max: max_frame_bytes });
    }
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&magic);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parse and bound a frame header, returning the payload length.
pub fn decode_frame_header(
    header: &[u8; FRAME_HEADER_BYTES],
    magic: [u8; 4],
    max_frame_bytes: usize,
) -> Result<usize, NetworkError> {
    if header[..4] != magic {
        return Err(NetworkError::BadMagic);
    }
    let len = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
    if FRAME_HEADER_BYTES + len > max_frame_bytes {
        return Err(NetworkError::MessageTooLarge {
            size: FRAME_HEADER_BYTES + len,
            max: max_frame_bytes,
        });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xai_core::address::{Address, Network};
    use xai_core::types::BlockHeader;

    const MAGIC: [u8; 4] = *b"RXAI";
    const MAX_FRAME: usize = 1 << 20;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            height: 9,
            prev_hash: Hash256([1; 32]),
            merkle_root: Hash256([2; 32]),
            timestamp: 1_700_000_000,
            difficulty_bits: 0x207f_ffff,
            nonce: 77,
            miner: Address::from_hash160([3; 20], Network::Regtest),
        }
    }

    fn round_trip(msg: Message) {
        let bytes = msg.encode();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn all_variants_round_trip() {
        round_trip(Message::Hello {
            version: 1,
            network_id: 2,
            best_tip_hash: Hash256([5; 32]),
            best_tip_height: 42,
            cumulative_work: ChainWork([7; 32]),
        });
        round_trip(Message::Ping(17));
        round_trip(Message::Pong(17));
        round_trip(Message::GetHeaders { from_hash: Hash256([9; 32]), count: 500 });
        round_trip(Message::Headers(vec![sample_header(), sample_header()]));
        round_trip(Message::GetBlock(Hash256([4; 32])));
        round_trip(Message::InvTx(vec![Hash256([1; 32]), Hash256([2; 32])]));
        round_trip(Message::InvBlock(vec![Hash256([3; 32])]));
        round_trip(Message::GetData(vec![
            InvItem { kind: InvKind::Tx, id: Hash256([1; 32]) },
            InvItem { kind: InvKind::Block, id: Hash256([2; 32]) },
        ]));
        round_trip(Message::Reject {
            id: Hash256([6; 32]),
            kind: RejectKind::Consensus,
            reason: "bad pow".into(),
        });
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            Message::decode(&[0xEE]),
            Err(CodecError::InvalidTag { what: "message", .. })
        ));
    }

    #[test]
    fn truncated_message_rejected() {
        let bytes = Message::GetBlock(Hash256([4; 32])).encode();
        assert!(Message::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn oversized_inv_fails_validation() {
        let msg = Message::InvTx(vec![Hash256::ZERO; MAX_INV_ITEMS + 1]);
        assert!(msg.validate().is_err());
        assert!(Message::InvTx(vec![Hash256::ZERO; MAX_INV_ITEMS]).validate().is_ok());
    }

    #[test]
    fn frame_round_trip() {
        let payload = Message::Ping(3).encode();
        let frame = encode_frame(MAGIC, &payload, MAX_FRAME).unwrap();
        assert_eq!(&frame[..4], &MAGIC);

        let header: [u8; FRAME_HEADER_BYTES] = frame[..8].try_into().unwrap();
        let len = decode_frame_header(&header, MAGIC, MAX_FRAME).unwrap();
        assert_eq!(len, payload.len());
        assert_eq!(&frame[8..], &payload[..]);
    }

    #[test]
    fn frame_wrong_magic_rejected() {
        let payload = Message::Ping(3).encode();
        let frame = encode_frame(MAGIC, &payload, MAX_FRAME).unwrap();
        let header: [u8; FRAME_HEADER_BYTES] = frame[..8].try_into().unwrap();
        assert!(matches!(
            decode_frame_header(&header, *b"XAI\x00", MAX_FRAME),
            Err(NetworkError::BadMagic)
        ));
    }

    #[test]
    fn frame_length_bound_enforced() {
        let mut header = [0u8; FRAME_HEADER_BYTES];
        header[..4].copy_from_slice(&MAGIC);
        header[4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_frame_header(&header, MAGIC, MAX_FRAME),
            Err(NetworkError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn oversized_payload_refused_at_encode() {
        let payload = vec![0u8; MAX_FRAME];
        assert!(matches!(
            encode_frame(MAGIC, &payload, MAX_FRAME),
            Err(NetworkError::MessageTooLarge { .. })
        ));
    }
}
