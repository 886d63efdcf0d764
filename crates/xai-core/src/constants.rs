//! Protocol-wide constants. All monetary values are micro-units (1 XAI = 10^6 µu).

/// Micro-units per whole coin (6 decimal places).
pub const COIN: u64 = 1_000_000;

/// Upper bound on the UTF-8 byte length of a transaction memo.
///
/// The coinbase uses the memo as its extra-nonce field, so the bound also
/// caps the miner's per-template search space extension.
pub const MAX_MEMO_BYTES: usize = 256;

/// Compressed secp256k1 public key length.
pub const PUBKEY_BYTES: usize = 33;

/// Compact ECDSA signature length.
pub const SIGNATURE_BYTES: usize = 64;

/// Number of ancestor timestamps used for the median-time-past rule.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum inputs in one transaction.
pub const MAX_INPUTS: usize = 1_000;
/// Maximum outputs in one transaction.
pub const MAX_OUTPUTS: usize = 1_000;

/// How many ancestors a node will walk backwards when asked to fill a gap
/// behind an orphan block.
pub const MAX_HEADER_WALK: u64 = 2_000;

/// Default P2P listen port.
pub const DEFAULT_P2P_PORT: u16 = 19333;
