//! Transaction validation: stateless shape checks and stateful checks
//! against a chain-state view.
//!
//! Stateless checks need no chain access and run before a transaction is
//! relayed or queued. Stateful checks run against a [`StateView`] snapshot
//! (UTXO set plus confirmed nonce index) and produce a
//! [`ValidatedTransaction`] carrying the derived fee facts the mempool and
//! miner rely on.
//!
//! The coinbase never passes through here — its shape and amount are block
//! validation's business.

use crate::address::Address;
use crate::codec::Encodable;
use crate::constants::{MAX_INPUTS, MAX_MEMO_BYTES, MAX_OUTPUTS};
use crate::crypto;
use crate::error::TransactionError;
use crate::params::NetworkParams;
use crate::types::{OutPoint, Transaction, UtxoEntry};

/// Read-only view of confirmed chain state used by stateful validation.
pub trait StateView {
    /// Look up an unspent output.
    fn utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;
    /// Next expected nonce for a sender from confirmed transactions.
    fn confirmed_next_nonce(&self, address: &Address) -> u64;
}

/// Adapter presenting any [`ChainStore`](crate::store::ChainStore) as a
/// [`StateView`] snapshot.
pub struct StoreView<'a, S: crate::store::ChainStore + ?Sized>(pub &'a S);

impl<S: crate::store::ChainStore + ?Sized> StateView for StoreView<'_, S> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.0.get_utxo(outpoint).ok().flatten()
    }
    fn confirmed_next_nonce(&self, address: &Address) -> u64 {
        self.0.next_nonce(address).unwrap_or(0)
    }
}

/// Facts derived while validating a transaction against state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedTransaction {
    pub txid: crate::types::Hash256,
    /// Declared fee, payable to the miner.
    pub fee: u64,
    /// Serialized size in bytes.
    pub size: usize,
    /// Input value exceeding outputs + fee; destroyed on inclusion.
    pub burned: u64,
}

/// Stateless checks: shape, ranges, encoding size, signature, and
/// sender/public-key correspondence. No chain access.
pub fn validate_transaction_stateless(
    tx: &Transaction,
    params: &NetworkParams,
) -> Result<(), TransactionError> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(TransactionError::EmptyInputsOrOutputs);
    }
    if tx.inputs.len() > MAX_INPUTS || tx.outputs.len() > MAX_OUTPUTS {
        return Err(TransactionError::TooManyInputsOrOutputs);
    }

    // No duplicate inputs.
    let mut seen = std::collections::HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input) {
            return Err(TransactionError::DuplicateInput(input.to_string()));
        }
    }

    for (index, output) in tx.outputs.iter().enumerate() {
        if output.amount == 0 {
            return Err(TransactionError::ZeroValueOutput(index));
        }
        if output.address.network() != params.network {
            return Err(TransactionError::WrongNetworkOutput(index));
        }
    }

    let total_out = tx.total_output_value().ok_or(TransactionError::ValueOverflow)?;
    total_out.checked_add(tx.fee).ok_or(TransactionError::ValueOverflow)?;

    if let Some(memo) = &tx.memo {
        if memo.len() > MAX_MEMO_BYTES {
            return Err(TransactionError::MemoTooLong { len: memo.len(), max: MAX_MEMO_BYTES });
        }
    }

    let size = tx.encoded_len();
    if size > params.max_tx_bytes {
        return Err(TransactionError::OversizedTransaction { size, max: params.max_tx_bytes });
    }

    // The sender must be on our network and derive from the public key.
    if tx.sender.network() != params.network {
        return Err(TransactionError::SenderMismatch);
    }
    let pubkey = crypto::PublicKey::from_bytes(&tx.sender_pubkey)
        .map_err(|_| TransactionError::InvalidSignature)?;
    if Address::from_public_key(&pubkey, params.network) != tx.sender {
        return Err(TransactionError::SenderMismatch);
    }

    crypto::verify_transaction_signature(tx).map_err(|_| TransactionError::InvalidSignature)?;

    Ok(())
}

/// Stateful checks against a snapshot: inputs exist and are mature, values
/// cover outputs + fee, the nonce matches, and locktime has passed.
///
/// `spend_height` is the height the transaction would confirm at (tip + 1
/// for mempool admission). `expected_nonce` lets callers that track pending
/// state (the mempool, the block validator walking a block) override the
/// confirmed nonce.
pub fn validate_transaction_stateful(
    tx: &Transaction,
    view: &impl StateView,
    spend_height: u64,
    expected_nonce: Option<u64>,
    params: &NetworkParams,
) -> Result<ValidatedTransaction, TransactionError> {
    if tx.locktime > 0 && spend_height < tx.locktime {
        return Err(TransactionError::LocktimeNotReached {
            locktime: tx.locktime,
            height: spend_height,
        });
    }

    let expected = expected_nonce.unwrap_or_else(|| view.confirmed_next_nonce(&tx.sender));
    if tx.nonce != expected {
        return Err(TransactionError::NonceMismatch { expected, got: tx.nonce });
    }

    let mut total_in: u64 = 0;
    for input in &tx.inputs {
        let entry = view
            .utxo(input)
            .ok_or_else(|| TransactionError::UnknownUtxo(input.to_string()))?;
        if entry.address != tx.sender {
            return Err(TransactionError::ForeignInput(input.to_string()));
        }
        if !entry.is_mature(spend_height, params.coinbase_maturity) {
            return Err(TransactionError::ImmatureCoinbase(input.to_string()));
        }
        total_in = total_in
            .checked_add(entry.amount)
            .ok_or(TransactionError::ValueOverflow)?;
    }

    let total_out = tx.total_output_value().ok_or(TransactionError::ValueOverflow)?;
    let needed = total_out.checked_add(tx.fee).ok_or(TransactionError::ValueOverflow)?;
    if total_in < needed {
        return Err(TransactionError::InsufficientFunds { have: total_in, need: needed });
    }

    Ok(ValidatedTransaction {
        txid: tx.txid(),
        fee: tx.fee,
        size: tx.encoded_len(),
        burned: total_in - needed,
    })
}
