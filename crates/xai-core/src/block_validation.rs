//! Block validation: header rules, structural rules, and stateful
//! application against a chain-state view.
//!
//! The header check covers parent linkage, expected difficulty, the
//! median-time-past window, clock skew, and proof-of-work. The structural
//! check covers coinbase shape, duplicate txids and inputs, the Merkle root,
//! and the size cap. [`validate_block`] composes both with per-transaction
//! stateful validation — walking per-sender nonces through the block and
//! letting later transactions spend outputs created earlier in it — and
//! finally pins the coinbase to exactly subsidy + fees.

use std::collections::{HashMap, HashSet};

use crate::address::Address;
use crate::codec::Encodable;
use crate::constants::{MAX_MEMO_BYTES, MEDIAN_TIME_SPAN};
use crate::difficulty;
use crate::error::{BlockError, TransactionError};
use crate::params::NetworkParams;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, UtxoEntry};
use crate::validation::{self, StateView};
use crate::merkle;

/// Everything the block validator needs to know about the chain context the
/// block claims to extend.
#[derive(Clone, Debug)]
pub struct BlockContext {
    /// Height the block must have (parent height + 1).
    pub height: u64,
    /// Hash the block's `prev_hash` must equal.
    pub prev_hash: Hash256,
    /// Difficulty bits the retarget schedule demands at this height.
    pub expected_bits: u32,
    /// Median of the last [`MEDIAN_TIME_SPAN`] ancestor timestamps.
    pub median_time_past: u64,
    /// Wall-clock seconds now, for the future-skew bound.
    pub now: u64,
    /// Subsidy the coinbase must mint at this height (fees come on top).
    pub expected_subsidy: u64,
}

/// Median of the most recent ancestor timestamps (up to [`MEDIAN_TIME_SPAN`]).
///
/// `timestamps` are ordered oldest to newest; an empty slice yields 0 so the
/// first mined block only races the genesis timestamp.
pub fn median_time_past(timestamps: &[u64]) -> u64 {
    if timestamps.is_empty() {
        return 0;
    }
    let start = timestamps.len().saturating_sub(MEDIAN_TIME_SPAN);
    let mut window: Vec<u64> = timestamps[start..].to_vec();
    window.sort_unstable();
    window[window.len() / 2]
}

/// Validate header rules against the expected chain context.
pub fn validate_header(
    header: &BlockHeader,
    ctx: &BlockContext,
    params: &NetworkParams,
) -> Result<(), BlockError> {
    if header.height != ctx.height {
        return Err(BlockError::HeightMismatch { expected: ctx.height, got: header.height });
    }
    if header.prev_hash != ctx.prev_hash {
        return Err(BlockError::PrevHashMismatch);
    }
    if header.difficulty_bits != ctx.expected_bits {
        return Err(BlockError::InvalidDifficulty {
            got: header.difficulty_bits,
            expected: ctx.expected_bits,
        });
    }
    let horizon = ctx.now.saturating_add(params.max_clock_skew_s);
    if header.timestamp > horizon {
        return Err(BlockError::TimestampTooFar(header.timestamp - horizon));
    }
    if header.timestamp <= ctx.median_time_past {
        return Err(BlockError::TimestampTooOld);
    }
    if !difficulty::check_pow(&header.hash(), header.difficulty_bits) {
        return Err(BlockError::InvalidPoW);
    }
    Ok(())
}

/// Validate everything about a block that needs no chain state: coinbase
/// shape, duplicate txids/inputs, Merkle commitment, size cap, and the
/// stateless rules of every regular transaction.
pub fn validate_block_structure(block: &Block, params: &NetworkParams) -> Result<(), BlockError> {
    let coinbase = block.coinbase().ok_or(BlockError::NoCoinbase)?;
    if !coinbase.is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }
    if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
        return Err(BlockError::MultipleCoinbase);
    }

    let size = block.encoded_len();
    if size > params.max_block_bytes {
        return Err(BlockError::OversizedBlock { size, max: params.max_block_bytes });
    }

    let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
    let mut seen_txids = HashSet::with_capacity(txids.len());
    for txid in &txids {
        if !seen_txids.insert(*txid) {
            return Err(BlockError::DuplicateTxid(txid.to_string()));
        }
    }

    let mut seen_inputs: HashSet<&OutPoint> = HashSet::new();
    for tx in &block.transactions {
        for input in &tx.inputs {
            if !seen_inputs.insert(input) {
                return Err(BlockError::DoubleSpend(input.to_string()));
            }
        }
    }

    if merkle::merkle_root(&txids) != block.header.merkle_root {
        return Err(BlockError::InvalidMerkleRoot);
    }

    // Coinbase shape: height-bound nonce, bounded extra-nonce memo, and
    // every output paying the header's miner.
    if coinbase.nonce != block.header.height {
        return Err(BlockError::Transaction {
            index: 0,
            source: TransactionError::InvalidCoinbase(format!(
                "nonce {} does not commit to height {}",
                coinbase.nonce, block.header.height
            )),
        });
    }
    if let Some(memo) = &coinbase.memo {
        if memo.len() > MAX_MEMO_BYTES {
            return Err(BlockError::Transaction {
                index: 0,
                source: TransactionError::MemoTooLong { len: memo.len(), max: MAX_MEMO_BYTES },
            });
        }
    }
    for (i, out) in coinbase.outputs.iter().enumerate() {
        if out.amount == 0 {
            return Err(BlockError::Transaction {
                index: 0,
                source: TransactionError::ZeroValueOutput(i),
            });
        }
        if out.address != block.header.miner {
            return Err(BlockError::Transaction {
                index: 0,
                source: TransactionError::InvalidCoinbase(
                    "output does not pay the block's miner".into(),
                ),
            });
        }
    }

    for (index, tx) in block.transactions.iter().enumerate().skip(1) {
        validation::validate_transaction_stateless(tx, params)
            .map_err(|source| BlockError::Transaction { index, source })?;
    }

    Ok(())
}

/// State view layered over a base snapshot: sees outputs created earlier in
/// the block being validated and hides outputs it already spent.
struct OverlayView<'a, V: StateView> {
    base: &'a V,
    created: HashMap<OutPoint, UtxoEntry>,
    spent: HashSet<OutPoint>,
}

impl<V: StateView> StateView for OverlayView<'_, V> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        if self.spent.contains(outpoint) {
            return None;
        }
        self.created.get(outpoint).cloned().or_else(|| self.base.utxo(outpoint))
    }
    fn confirmed_next_nonce(&self, address: &Address) -> u64 {
        self.base.confirmed_next_nonce(address)
    }
}

/// Fully validate a block against chain state.
///
/// Returns the total fees collected by the block's transactions.
pub fn validate_block(
    block: &Block,
    ctx: &BlockContext,
    view: &impl StateView,
    params: &NetworkParams,
) -> Result<u64, BlockError> {
    validate_header(&block.header, ctx, params)?;
    validate_block_structure(block, params)?;

    let mut overlay = OverlayView { base: view, created: HashMap::new(), spent: HashSet::new() };
    let mut pending_nonces: HashMap<Address, u64> = HashMap::new();
    let mut total_fees: u64 = 0;

    for (index, tx) in block.transactions.iter().enumerate() {
        if index == 0 {
            // Coinbase outputs become spendable for later blocks, not this one,
            // but they still occupy their outpoints.
            stage_outputs(&mut overlay, tx, ctx.height);
            continue;
        }

        let expected = *pending_nonces
            .entry(tx.sender)
            .or_insert_with(|| view.confirmed_next_nonce(&tx.sender));
        let validated =
            validation::validate_transaction_stateful(tx, &overlay, ctx.height, Some(expected), params)
                .map_err(|source| BlockError::Transaction { index, source })?;

        pending_nonces.insert(tx.sender, expected + 1);
        total_fees = total_fees
            .checked_add(validated.fee)
            .ok_or(BlockError::Transaction { index, source: TransactionError::ValueOverflow })?;

        for input in &tx.inputs {
            overlay.created.remove(input);
            overlay.spent.insert(*input);
        }
        stage_outputs(&mut overlay, tx, ctx.height);
    }

    // The coinbase pays exactly subsidy + fees, not a micro-unit more or less.
    let coinbase_total = block
        .coinbase()
        .and_then(|cb| cb.total_output_value())
        .ok_or(BlockError::NoCoinbase)?;
    let expected_total = ctx
        .expected_subsidy
        .checked_add(total_fees)
        .ok_or(BlockError::Transaction { index: 0, source: TransactionError::ValueOverflow })?;
    if coinbase_total != expected_total {
        return Err(BlockError::InvalidCoinbaseAmount {
            got: coinbase_total,
            expected: expected_total,
        });
    }

    Ok(total_fees)
}

fn stage_outputs<V: StateView>(overlay: &mut OverlayView<'_, V>, tx: &crate::types::Transaction, height: u64) {
    let txid = tx.txid();
    for (vout, out) in tx.outputs.iter().enumerate() {
        overlay.created.insert(
            OutPoint { txid, vout: vout as u32 },
            UtxoEntry {
                address: out.address,
                amount: out.amount,
                height,
                coinbase: tx.is_coinbase(),
            },
        );
    }
}
