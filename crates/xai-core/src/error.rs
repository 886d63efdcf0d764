//! Error types for the XAI protocol.
//!
//! Every component surfaces a tagged error; [`ErrorKind`] is the coarse
//! classification the P2P layer uses to decide between rejecting an object,
//! debiting a peer's reputation, caching an orphan, or halting the node.
use thiserror::Error;

/// Coarse error classification for peer punishment and recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Stateless shape, signature, or encoding failure.
    Validation,
    /// A rule of the chain was broken (PoW, subsidy, difficulty, nonce).
    Consensus,
    /// Double-spend or nonce gap; not necessarily malicious.
    Conflict,
    /// Parent missing; retain and request ancestors.
    Orphan,
    /// Peer exceeded a rate limit.
    RateLimit,
    /// Persistent storage failed; fatal for state mutation.
    Storage,
    /// Transient network failure.
    Network,
    /// Invalid configuration; fatal at startup.
    Config,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")] UnexpectedEof(usize),
    #[error("varint overflow")] VarintOverflow,
    #[error("length prefix {len} exceeds remaining {remaining} bytes")] LengthOutOfBounds { len: u64, remaining: usize },
    #[error("invalid UTF-8 in string field")] InvalidUtf8,
    #[error("trailing bytes after decode: {0}")] TrailingBytes(usize),
    #[error("invalid tag {tag} for {what}")] InvalidTag { what: &'static str, tag: u8 },
    #[error("collection too large: {len} > {max}")] OversizedCollection { len: u64, max: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid secret key bytes")] InvalidSecretKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("unknown prefix: {0}")] UnknownPrefix(String),
    #[error("wrong network: expected {expected}, got {got}")] WrongNetwork { expected: String, got: String },
    #[error("invalid length")] InvalidLength,
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid character: {0}")] InvalidCharacter(char),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("unknown UTXO: {0}")] UnknownUtxo(String),
    #[error("insufficient funds: have {have}, need {need}")] InsufficientFunds { have: u64, need: u64 },
    #[error("invalid signature")] InvalidSignature,
    #[error("sender address does not derive from public key")] SenderMismatch,
    #[error("duplicate input: {0}")] DuplicateInput(String),
    #[error("input {0} not owned by sender")] ForeignInput(String),
    #[error("oversized: {size} > {max}")] OversizedTransaction { size: usize, max: usize },
    #[error("empty inputs or outputs")] EmptyInputsOrOutputs,
    #[error("zero-value output at index {0}")] ZeroValueOutput(usize),
    #[error("value overflow")] ValueOverflow,
    #[error("fee below relay floor: {fee} < {minimum}")] FeeTooLow { fee: u64, minimum: u64 },
    #[error("nonce mismatch: expected {expected}, got {got}")] NonceMismatch { expected: u64, got: u64 },
    #[error("immature coinbase UTXO: {0}")] ImmatureCoinbase(String),
    #[error("invalid coinbase: {0}")] InvalidCoinbase(String),
    #[error("memo too long: {len} > {max}")] MemoTooLong { len: usize, max: usize },
    #[error("locktime {locktime} not reached at height {height}")] LocktimeNotReached { locktime: u64, height: u64 },
    #[error("too many inputs or outputs")] TooManyInputsOrOutputs,
    #[error("wrong network address in output {0}")] WrongNetworkOutput(usize),
    #[error("codec: {0}")] Codec(#[from] CodecError),
}

impl TransactionError {
    /// Classify for peer punishment.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownUtxo(_)
            | Self::InsufficientFunds { .. }
            | Self::NonceMismatch { .. }
            | Self::LocktimeNotReached { .. }
            | Self::ImmatureCoinbase(_) => ErrorKind::Conflict,
            _ => ErrorKind::Validation,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("proof of work does not meet target")] InvalidPoW,
    #[error("unknown parent: {0}")] UnknownParent(String),
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u64, got: u64 },
    #[error("previous hash mismatch")] PrevHashMismatch,
    #[error("timestamp not after median time past")] TimestampTooOld,
    #[error("timestamp {0}s in the future beyond allowed skew")] TimestampTooFar(u64),
    #[error("invalid merkle root")] InvalidMerkleRoot,
    #[error("invalid difficulty bits: got {got:#010x}, expected {expected:#010x}")] InvalidDifficulty { got: u32, expected: u32 },
    #[error("invalid coinbase amount: got {got}, expected {expected}")] InvalidCoinbaseAmount { got: u64, expected: u64 },
    #[error("no coinbase")] NoCoinbase,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("duplicate txid: {0}")] DuplicateTxid(String),
    #[error("double spend across transactions: {0}")] DoubleSpend(String),
    #[error("oversized: {size} > {max}")] OversizedBlock { size: usize, max: usize },
    #[error("tx error at index {index}: {source}")] Transaction { index: usize, source: TransactionError },
    #[error("codec: {0}")] Codec(#[from] CodecError),
}

impl BlockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownParent(_) => ErrorKind::Orphan,
            Self::InvalidPoW
            | Self::InvalidDifficulty { .. }
            | Self::InvalidCoinbaseAmount { .. }
            | Self::TimestampTooOld
            | Self::TimestampTooFar(_) => ErrorKind::Consensus,
            Self::Transaction { source, .. } => source.kind(),
            _ => ErrorKind::Validation,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtxoError {
    #[error("missing UTXO: {0}")] Missing(String),
    #[error("immature coinbase UTXO: {outpoint} (created at {created}, height {height})")] Immature { outpoint: String, created: u64, height: u64 },
    #[error("duplicate outpoint produced: {0}")] DuplicateOutpoint(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("conflicts with pool tx {existing} on outpoint {outpoint}")] Conflict { existing: String, outpoint: String },
    #[error("nonce gap: expected {expected}, got {got}")] NonceGap { expected: u64, got: u64 },
    #[error("replacement fee rate {got} below required {required}")] ReplacementFeeTooLow { got: u64, required: u64 },
    #[error("replacement inputs do not cover the original's")] ReplacementInputsMismatch,
    #[error("replaced tx {0} not in pool")] ReplacedTxUnknown(String),
    #[error("fee rate {rate} below eviction floor {floor}")] BelowEvictionFloor { rate: u64, floor: u64 },
    #[error("pool full")] PoolFull,
    #[error(transparent)] Transaction(#[from] TransactionError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("empty chain: no blocks connected")] EmptyChain,
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("undo data missing for block: {0}")] UndoDataMissing(String),
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u64, got: u64 },
    #[error("duplicate block: {0}")] DuplicateBlock(String),
    #[error("reorganization depth {depth} exceeds limit {max}")] ReorgTooDeep { depth: u64, max: u64 },
    #[error("reorganization aborted and previous tip restored: {0}")] ReorgAborted(String),
    #[error("checkpoint mismatch at height {0}")] CheckpointMismatch(u64),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Utxo(#[from] UtxoError),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Block(b) => b.kind(),
            Self::ReorgTooDeep { .. } | Self::CheckpointMismatch(_) => ErrorKind::Consensus,
            Self::Utxo(_) => ErrorKind::Conflict,
            _ => ErrorKind::Validation,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("peer disconnected: {0}")] PeerDisconnected(String),
    #[error("message too large: {size} > {max}")] MessageTooLarge { size: usize, max: usize },
    #[error("bad magic bytes")] BadMagic,
    #[error("invalid envelope signature")] InvalidEnvelopeSignature,
    #[error("envelope timestamp outside replay window")] StaleEnvelope,
    #[error("replayed envelope nonce")] ReplayedNonce,
    #[error("rate limited")] RateLimited,
    #[error("peer banned")] PeerBanned,
    #[error("timeout")] Timeout,
    #[error("codec: {0}")] Codec(#[from] CodecError),
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited => ErrorKind::RateLimit,
            Self::Timeout | Self::PeerDisconnected(_) => ErrorKind::Network,
            _ => ErrorKind::Validation,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")] Invalid { field: &'static str, reason: String },
}

/// Top-level error for the XAI node.
#[derive(Error, Debug)]
pub enum XaiError {
    #[error(transparent)] Codec(#[from] CodecError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Address(#[from] AddressError),
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Utxo(#[from] UtxoError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] Chain(#[from] ChainError),
    #[error(transparent)] Network(#[from] NetworkError),
    #[error(transparent)] Config(#[from] ConfigError),
    #[error("storage: {0}")] Storage(String),
}

impl XaiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Codec(_) | Self::Crypto(_) | Self::Address(_) => ErrorKind::Validation,
            Self::Transaction(e) => e.kind(),
            Self::Block(e) => e.kind(),
            Self::Utxo(_) => ErrorKind::Conflict,
            Self::Mempool(MempoolError::Transaction(e)) => e.kind(),
            Self::Mempool(_) => ErrorKind::Conflict,
            Self::Chain(e) => e.kind(),
            Self::Network(e) => e.kind(),
            Self::Config(_) => ErrorKind::Config,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_error_kinds() {
        assert_eq!(BlockError::InvalidPoW.kind(), ErrorKind::Consensus);
        assert_eq!(BlockError::UnknownParent("x".into()).kind(), ErrorKind::Orphan);
        assert_eq!(BlockError::InvalidMerkleRoot.kind(), ErrorKind::Validation);
    }

    #[test]
    fn tx_error_kinds() {
        assert_eq!(TransactionError::InvalidSignature.kind(), ErrorKind::Validation);
        assert_eq!(
            TransactionError::NonceMismatch { expected: 1, got: 2 }.kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn storage_is_fatal_kind() {
        assert_eq!(XaiError::Storage("disk".into()).kind(), ErrorKind::Storage);
    }

    #[test]
    fn error_display_nonempty() {
        let errors: Vec<ChainError> = vec![
            ChainError::EmptyChain,
            ChainError::ReorgTooDeep { depth: 10, max: 6 },
            ChainError::CheckpointMismatch(100),
        ];
        for e in &errors {
            assert!(!format!("{e}").is_empty());
        }
    }
}
