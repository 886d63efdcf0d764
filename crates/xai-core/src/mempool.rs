//! In-memory pool of unconfirmed transactions.
//!
//! The mempool stores validated transactions awaiting inclusion in blocks.
//! It provides:
//! - O(1) lookup by txid and conflict detection via a spent-outpoint index
//! - fee-rate-ordered selection for block templates, honouring per-sender
//!   nonce order (parent before child)
//! - per-sender nonce gating: pending nonces are contiguous from the
//!   confirmed next nonce, so admission requires exactly the next one
//! - replace-by-fee: an RBF transaction with the same sender and nonce whose
//!   inputs cover the original's replaces it for a fee-rate bump of
//!   `rbf_bump_percent`
//! - byte-bounded storage with lowest-fee-rate eviction and an eviction
//!   floor that rejects underpriced admissions while the pool is saturated
//! - TTL expiry of stale entries
//!
//! Callers run stateless validation before insertion; the pool performs the
//! stateful checks itself against the supplied [`StateView`] snapshot, so
//! admission never holds any chain lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::address::Address;
use crate::codec::Encodable;
use crate::error::{MempoolError, TransactionError};
use crate::params::NetworkParams;
use crate::types::{Block, Hash256, OutPoint, Transaction};
use crate::validation::{self, StateView};

/// Fee rate precision: rates are milli-µu per byte.
const FEE_RATE_PRECISION: u128 = 1_000;

/// Pool utilisation below which the eviction floor resets.
const FLOOR_RESET_PERCENT: usize = 90;

/// Compute a fee rate in milli-µu per byte.
fn compute_fee_rate(fee: u64, size: usize) -> u64 {
    if size == 0 {
        return u64::MAX;
    }
    let rate = (fee as u128) * FEE_RATE_PRECISION / (size as u128);
    rate.min(u64::MAX as u128) as u64
}

/// A transaction stored in the mempool with precomputed metadata.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    /// Fee in micro-units.
    pub fee: u64,
    /// Serialized size in bytes.
    pub size: usize,
    /// Fee rate in milli-µu per byte.
    fee_rate: u64,
    /// Monotonic admission sequence; earlier is better on fee-rate ties.
    seq: u64,
    /// When the entry was admitted, for TTL expiry.
    arrival: Instant,
}

impl MempoolEntry {
    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }
}

/// In-memory pool of unconfirmed transactions.
///
/// Not thread-safe — the node wraps it in a `Mutex`; admission validates
/// against a state snapshot outside any chain lock.
pub struct Mempool {
    params: NetworkParams,
    /// Primary storage: txid → entry.
    entries: HashMap<Hash256, MempoolEntry>,
    /// Spent outpoint → txid of the pool transaction spending it.
    by_outpoint: HashMap<OutPoint, Hash256>,
    /// Ordering index: `(fee_rate, u64::MAX - seq, txid)` ascending, so the
    /// first element is the eviction victim and reverse iteration yields
    /// highest-fee-rate, earliest-arrival first.
    by_fee_rate: BTreeSet<(u64, u64, Hash256)>,
    /// Per-sender pending nonce chains: nonce → txid, contiguous from the
    /// sender's confirmed next nonce.
    by_sender: HashMap<Address, BTreeMap<u64, Hash256>>,
    /// Current total serialized bytes.
    total_bytes: usize,
    /// Admission sequence counter.
    next_seq: u64,
    /// Highest fee rate evicted for capacity since the pool was last
    /// comfortably below capacity. New admissions must beat it.
    eviction_floor: Option<u64>,
}

impl Mempool {
    pub fn new(params: NetworkParams) -> Self {
        Self {
            params,
            entries: HashMap::new(),
            by_outpoint: HashMap::new(),
            by_fee_rate: BTreeSet::new(),
            by_sender: HashMap::new(),
            total_bytes: 0,
            next_seq: 0,
            eviction_floor: None,
        }
    }

    /// The nonce the next transaction from `sender` must carry: the
    /// confirmed next nonce advanced past this sender's pending chain.
    pub fn next_pending_nonce(&self, sender: &Address, view: &impl StateView) -> u64 {
        let confirmed = view.confirmed_next_nonce(sender);
        match self.by_sender.get(sender) {
            Some(chain) => {
                confirmed + chain.range(confirmed..).count() as u64
            }
            None => confirmed,
        }
    }

    /// Admit a transaction.
    ///
    /// The caller has already run
    /// [`validate_transaction_stateless`](validation::validate_transaction_stateless);
    /// this performs stateful validation against `view` at `tip_height + 1`,
    /// nonce gating, conflict/RBF resolution, the relay-fee floor, and
    /// capacity eviction. Returns the txid on success.
    pub fn insert(
        &mut self,
        tx: Transaction,
        view: &impl StateView,
        tip_height: u64,
    ) -> Result<Hash256, MempoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_string()));
        }
        if tx.is_coinbase() {
            return Err(TransactionError::InvalidCoinbase("coinbase cannot be relayed".into()).into());
        }
        if tx.fee < self.params.min_relay_fee {
            return Err(TransactionError::FeeTooLow {
                fee: tx.fee,
                minimum: self.params.min_relay_fee,
            }
            .into());
        }

        // Nonce gating: exactly the next pending nonce, or an RBF
        // replacement of an existing pending nonce.
        let next_nonce = self.next_pending_nonce(&tx.sender, view);
        let confirmed = view.confirmed_next_nonce(&tx.sender);
        let replaced = if tx.nonce == next_nonce {
            None
        } else if tx.nonce >= confirmed && tx.nonce < next_nonce && tx.rbf {
            Some(self.check_replacement(&tx)?)
        } else {
            return Err(MempoolError::NonceGap { expected: next_nonce, got: tx.nonce });
        };

        // Input conflicts with other pool transactions (the replaced parent
        // is allowed to overlap, that is the point of RBF).
        for input in &tx.inputs {
            if let Some(existing) = self.by_outpoint.get(input) {
                if Some(*existing) != replaced {
                    return Err(MempoolError::Conflict {
                        existing: existing.to_string(),
                        outpoint: input.to_string(),
                    });
                }
            }
        }

        // Stateful validation against the snapshot at the next height.
        let validated = validation::validate_transaction_stateful(
            &tx,
            view,
            tip_height + 1,
            Some(tx.nonce),
            &self.params,
        )?;
        let fee_rate = compute_fee_rate(validated.fee, validated.size);

        // Eviction floor: while the pool sits near capacity, refuse anything
        // not beating the best rate we already had to evict.
        if let Some(floor) = self.eviction_floor {
            if fee_rate <= floor {
                return Err(MempoolError::BelowEvictionFloor { rate: fee_rate, floor });
            }
        }

        // Make room, cheapest entries first. Never evict to admit a worse rate.
        while self.total_bytes + validated.size > self.params.mempool_max_bytes {
            let Some(&(lowest_rate, _, lowest_txid)) = self.by_fee_rate.iter().next() else {
                return Err(MempoolError::PoolFull);
            };
            if lowest_rate >= fee_rate || lowest_txid == txid {
                return Err(MempoolError::PoolFull);
            }
            self.evict_for_capacity(lowest_txid);
        }

        if let Some(parent) = replaced {
            self.remove_entry(&parent);
        }

        let entry = MempoolEntry {
            txid,
            fee: validated.fee,
            size: validated.size,
            fee_rate,
            seq: self.next_seq,
            arrival: Instant::now(),
            tx,
        };
        self.next_seq += 1;

        for input in &entry.tx.inputs {
            self.by_outpoint.insert(*input, txid);
        }
        self.by_fee_rate.insert((fee_rate, u64::MAX - entry.seq, txid));
        self.by_sender.entry(entry.tx.sender).or_default().insert(entry.tx.nonce, txid);
        self.total_bytes += entry.size;
        self.entries.insert(txid, entry);

        debug!(%txid, fee_rate, "mempool: admitted");
        Ok(txid)
    }

    /// Validate an RBF replacement and return the parent's txid.
    fn check_replacement(&self, tx: &Transaction) -> Result<Hash256, MempoolError> {
        let parent_txid = self
            .by_sender
            .get(&tx.sender)
            .and_then(|chain| chain.get(&tx.nonce))
            .copied()
            .ok_or(MempoolError::NonceGap { expected: tx.nonce, got: tx.nonce })?;

        if let Some(claimed) = tx.replaces_txid {
            if claimed != parent_txid {
                return Err(MempoolError::ReplacedTxUnknown(claimed.to_string()));
            }
        }

        let parent = self.entries.get(&parent_txid).expect("indexed entry exists");

        // The replacement's inputs must cover the parent's, so the parent
        // cannot sneak back in through a disjoint spend.
        let inputs: HashSet<&OutPoint> = tx.inputs.iter().collect();
        if !parent.tx.inputs.iter().all(|op| inputs.contains(op)) {
            return Err(MempoolError::ReplacementInputsMismatch);
        }

        let new_rate = compute_fee_rate(tx.fee, tx.encoded_len());
        let required = parent
            .fee_rate
            .saturating_mul(100 + self.params.rbf_bump_percent)
            / 100;
        if new_rate < required {
            return Err(MempoolError::ReplacementFeeTooLow { got: new_rate, required });
        }

        Ok(parent_txid)
    }

    /// Remove an entry and its indexes. Returns it if present.
    fn remove_entry(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            self.by_outpoint.remove(input);
        }
        self.by_fee_rate.remove(&(entry.fee_rate, u64::MAX - entry.seq, entry.txid));
        if let Some(chain) = self.by_sender.get_mut(&entry.tx.sender) {
            chain.remove(&entry.tx.nonce);
            if chain.is_empty() {
                self.by_sender.remove(&entry.tx.sender);
            }
        }
        self.total_bytes -= entry.size;
        Some(entry)
    }

    /// Remove an entry plus the sender's higher-nonce descendants, which
    /// would otherwise be stranded behind a nonce gap.
    fn remove_with_descendants(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let mut removed = Vec::new();
        let Some(entry) = self.remove_entry(txid) else {
            return removed;
        };
        let sender = entry.tx.sender;
        let nonce = entry.tx.nonce;
        removed.push(entry);

        let descendants: Vec<Hash256> = self
            .by_sender
            .get(&sender)
            .map(|chain| chain.range(nonce + 1..).map(|(_, t)| *t).collect())
            .unwrap_or_default();
        for txid in descendants {
            if let Some(e) = self.remove_entry(&txid) {
                removed.push(e);
            }
        }
        removed
    }

    fn evict_for_capacity(&mut self, txid: Hash256) {
        for entry in self.remove_with_descendants(&txid) {
            debug!(txid = %entry.txid, rate = entry.fee_rate, "mempool: evicted for capacity");
            self.eviction_floor =
                Some(self.eviction_floor.unwrap_or(0).max(entry.fee_rate));
        }
    }

    /// Drop entries older than the pool TTL. Returns how many were removed.
    pub fn evict_expired(&mut self) -> usize {
        let ttl = Duration::from_secs(self.params.mempool_ttl_s);
        let expired: Vec<Hash256> = self
            .entries
            .values()
            .filter(|e| e.arrival.elapsed() >= ttl)
            .map(|e| e.txid)
            .collect();
        let mut removed = 0;
        for txid in expired {
            removed += self.remove_with_descendants(&txid).len();
        }
        if removed > 0 {
            debug!(removed, "mempool: expired entries dropped");
        }
        self.maybe_reset_floor();
        removed
    }

    /// Called when a block is committed: drop included txids, conflicting
    /// spends, and entries made stale by the confirmed nonces.
    pub fn remove_confirmed_block(&mut self, block: &Block, view: &impl StateView) {
        for tx in &block.transactions {
            self.remove_entry(&tx.txid());
        }

        let spent: Vec<OutPoint> =
            block.transactions.iter().flat_map(|tx| tx.inputs.iter().copied()).collect();
        for outpoint in spent {
            if let Some(txid) = self.by_outpoint.get(&outpoint).copied() {
                for e in self.remove_with_descendants(&txid) {
                    debug!(txid = %e.txid, "mempool: removed, conflicts with committed block");
                }
            }
        }

        // Confirmed nonces advanced: drop anything now behind them.
        let senders: Vec<Address> = self.by_sender.keys().copied().collect();
        for sender in senders {
            let confirmed = view.confirmed_next_nonce(&sender);
            let stale: Vec<Hash256> = self
                .by_sender
                .get(&sender)
                .map(|chain| chain.range(..confirmed).map(|(_, t)| *t).collect())
                .unwrap_or_default();
            for txid in stale {
                self.remove_entry(&txid);
            }
        }

        self.maybe_reset_floor();
    }

    fn maybe_reset_floor(&mut self) {
        if self.total_bytes * 100 < self.params.mempool_max_bytes * FLOOR_RESET_PERCENT {
            self.eviction_floor = None;
        }
    }

    /// Select transactions for a block template.
    ///
    /// Descending fee rate, ascending arrival on ties, subject to per-sender
    /// nonce order: a child is only considered once its parent is selected,
    /// and a chain stops at the first member that does not fit.
    pub fn select_for_block(&self, max_bytes: usize, view: &impl StateView) -> Vec<&MempoolEntry> {
        let mut selected: Vec<&MempoolEntry> = Vec::new();
        let mut remaining = max_bytes;
        // Sender → next selectable nonce.
        let mut sender_next: HashMap<Address, u64> = HashMap::new();
        // Deferred children waiting for their parent: (sender, nonce) → txid.
        let mut deferred: HashMap<(Address, u64), Hash256> = HashMap::new();

        for (_, _, txid) in self.by_fee_rate.iter().rev() {
            let Some(entry) = self.entries.get(txid) else { continue };
            let sender = entry.tx.sender;
            let next = *sender_next
                .entry(sender)
                .or_insert_with(|| view.confirmed_next_nonce(&sender));

            if entry.tx.nonce > next {
                deferred.insert((sender, entry.tx.nonce), *txid);
                continue;
            }
            if entry.tx.nonce < next {
                continue; // stale, will be pruned on the next block event
            }
            if entry.size > remaining {
                continue; // chain stops here; children stay deferred
            }

            selected.push(entry);
            remaining -= entry.size;
            let mut nonce = entry.tx.nonce + 1;
            sender_next.insert(sender, nonce);

            // Pull any children that were deferred behind this parent.
            while let Some(child_txid) = deferred.remove(&(sender, nonce)) {
                let Some(child) = self.entries.get(&child_txid) else { break };
                if child.size > remaining {
                    break;
                }
                selected.push(child);
                remaining -= child.size;
                nonce += 1;
                sender_next.insert(sender, nonce);
            }
        }

        selected
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Remove a transaction by txid (with its stranded descendants).
    pub fn remove(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let removed = self.remove_with_descendants(txid);
        self.maybe_reset_floor();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    /// Net pending spend per address: outgoing value + fees from pending
    /// transactions, minus pending outputs received. Used for the derived
    /// account view.
    pub fn pending_delta(&self, address: &Address) -> i128 {
        let mut delta: i128 = 0;
        for entry in self.entries.values() {
            if entry.tx.sender == *address {
                let out: u64 = entry.tx.outputs.iter().map(|o| o.amount).sum();
                delta -= i128::from(out) + i128::from(entry.tx.fee);
            }
            for out in &entry.tx.outputs {
                if out.address == *address {
                    delta += i128::from(out.amount);
                }
            }
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;
    use crate::constants::COIN;
    use crate::crypto::{self, KeyPair};
    use crate::types::{TxOutput, UtxoEntry};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    struct TestView {
        utxos: HashMap<OutPoint, UtxoEntry>,
        nonces: HashMap<Address, u64>,
    }

    impl TestView {
        fn new() -> Self {
            Self { utxos: HashMap::new(), nonces: HashMap::new() }
        }

        fn fund(&mut self, seed: u8, owner: Address, amount: u64) -> OutPoint {
            let outpoint = OutPoint { txid: Hash256([seed; 32]), vout: 0 };
            self.utxos.insert(
                outpoint,
                UtxoEntry { address: owner, amount, height: 0, coinbase: false },
            );
            outpoint
        }
    }

    impl StateView for TestView {
        fn utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
            self.utxos.get(outpoint).cloned()
        }
        fn confirmed_next_nonce(&self, address: &Address) -> u64 {
            self.nonces.get(address).copied().unwrap_or(0)
        }
    }

    fn params() -> NetworkParams {
        NetworkParams::regtest()
    }

    struct Wallet {
        kp: KeyPair,
        address: Address,
    }

    fn wallet(seed: u8) -> Wallet {
        let kp = KeyPair::from_secret_bytes(&[seed; 32]).unwrap();
        let address = Address::from_public_key(&kp.public_key(), Network::Regtest);
        Wallet { kp, address }
    }

    fn build_tx(w: &Wallet, inputs: Vec<OutPoint>, nonce: u64, fee: u64, rbf: bool) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs,
            outputs: vec![TxOutput {
                address: Address::from_hash160([0xCC; 20], Network::Regtest),
                amount: COIN,
            }],
            locktime: 0,
            sender: w.address,
            sender_pubkey: [0; 33],
            signature: [0; 64],
            nonce,
            fee,
            memo: None,
            replaces_txid: None,
            rbf,
        };
        crypto::sign_transaction(&mut tx, &w.kp);
        tx
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    #[test]
    fn admits_valid_transaction() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        let tx = build_tx(&w, vec![op], 0, 1_000, false);
        let txid = pool.insert(tx, &view, 10).unwrap();
        assert!(pool.contains(&txid));
        assert_eq!(pool.len(), 1);
        assert!(pool.total_bytes() > 0);
    }

    #[test]
    fn duplicate_txid_rejected() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        let tx = build_tx(&w, vec![op], 0, 1_000, false);
        pool.insert(tx.clone(), &view, 10).unwrap();
        assert!(matches!(
            pool.insert(tx, &view, 10),
            Err(MempoolError::AlreadyExists(_))
        ));
    }

    #[test]
    fn fee_floor_boundary() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op1 = view.fund(1, w.address, 10 * COIN);
        let op2 = view.fund(2, w.address, 10 * COIN);

        // Exactly min_relay_fee: accepted.
        let tx = build_tx(&w, vec![op1], 0, params().min_relay_fee, false);
        pool.insert(tx, &view, 10).unwrap();

        // One micro-unit below: rejected.
        let tx = build_tx(&w, vec![op2], 1, params().min_relay_fee - 1, false);
        assert!(matches!(
            pool.insert(tx, &view, 10),
            Err(MempoolError::Transaction(TransactionError::FeeTooLow { .. }))
        ));
    }

    #[test]
    fn nonce_gap_rejected() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        let tx = build_tx(&w, vec![op], 2, 1_000, false);
        assert_eq!(
            pool.insert(tx, &view, 10),
            Err(MempoolError::NonceGap { expected: 0, got: 2 })
        );
    }

    #[test]
    fn sequential_nonces_accepted() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op0 = view.fund(1, w.address, 10 * COIN);
        let op1 = view.fund(2, w.address, 10 * COIN);

        pool.insert(build_tx(&w, vec![op0], 0, 1_000, false), &view, 10).unwrap();
        assert_eq!(pool.next_pending_nonce(&w.address, &view), 1);
        pool.insert(build_tx(&w, vec![op1], 1, 1_000, false), &view, 10).unwrap();
        assert_eq!(pool.next_pending_nonce(&w.address, &view), 2);
    }

    #[test]
    fn double_spend_without_rbf_rejected() {
        let mut pool = Mempool::new(params());
        let w1 = wallet(0x61);
        let w2 = wallet(0x62);
        let mut view = TestView::new();
        let shared = view.fund(1, w1.address, 10 * COIN);

        pool.insert(build_tx(&w1, vec![shared], 0, 1_000, false), &view, 10).unwrap();

        // Different sender spending the same outpoint: conflict, not RBF.
        let conflicting = build_tx(&w2, vec![shared], 0, 2_000, false);
        assert!(matches!(
            pool.insert(conflicting, &view, 10),
            Err(MempoolError::Conflict { .. })
        ));
    }

    // ------------------------------------------------------------------
    // Replace-by-fee
    // ------------------------------------------------------------------

    #[test]
    fn rbf_replaces_with_sufficient_bump() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        let t1 = build_tx(&w, vec![op], 0, 1_000, false);
        let t1_txid = pool.insert(t1, &view, 10).unwrap();

        // 1.5× the fee easily clears the 10% bump requirement.
        let t2 = build_tx(&w, vec![op], 0, 1_500, true);
        let t2_txid = pool.insert(t2, &view, 10).unwrap();

        assert!(!pool.contains(&t1_txid), "original must be evicted");
        assert!(pool.contains(&t2_txid));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn rbf_without_flag_conflicts() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        pool.insert(build_tx(&w, vec![op], 0, 1_000, false), &view, 10).unwrap();
        let t2 = build_tx(&w, vec![op], 0, 1_500, false);
        assert!(matches!(
            pool.insert(t2, &view, 10),
            Err(MempoolError::NonceGap { .. })
        ));
    }

    #[test]
    fn rbf_with_insufficient_bump_rejected() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        pool.insert(build_tx(&w, vec![op], 0, 10_000, false), &view, 10).unwrap();
        // 1% more fee < required 10% bump.
        let t2 = build_tx(&w, vec![op], 0, 10_100, true);
        assert!(matches!(
            pool.insert(t2, &view, 10),
            Err(MempoolError::ReplacementFeeTooLow { .. })
        ));
    }

    #[test]
    fn rbf_must_cover_parent_inputs() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op_a = view.fund(1, w.address, 10 * COIN);
        let op_b = view.fund(2, w.address, 10 * COIN);

        pool.insert(build_tx(&w, vec![op_a], 0, 1_000, false), &view, 10).unwrap();
        // Disjoint input set with the same nonce: not a valid replacement.
        let t2 = build_tx(&w, vec![op_b], 0, 5_000, true);
        assert!(matches!(
            pool.insert(t2, &view, 10),
            Err(MempoolError::ReplacementInputsMismatch)
        ));
    }

    #[test]
    fn rbf_replaces_txid_claim_must_match() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        pool.insert(build_tx(&w, vec![op], 0, 1_000, false), &view, 10).unwrap();

        let mut t2 = build_tx(&w, vec![op], 0, 5_000, true);
        t2.replaces_txid = Some(Hash256([0xEE; 32]));
        crypto::sign_transaction(&mut t2, &w.kp);
        assert!(matches!(
            pool.insert(t2, &view, 10),
            Err(MempoolError::ReplacedTxUnknown(_))
        ));
    }

    // ------------------------------------------------------------------
    // Block events
    // ------------------------------------------------------------------

    fn block_with(txs: Vec<Transaction>) -> Block {
        Block {
            header: crate::types::BlockHeader {
                version: 1,
                height: 11,
                prev_hash: Hash256([1; 32]),
                merkle_root: Hash256::ZERO,
                timestamp: 0,
                difficulty_bits: 0x207f_ffff,
                nonce: 0,
                miner: Address::from_hash160([0xAA; 20], Network::Regtest),
            },
            transactions: txs,
        }
    }

    #[test]
    fn confirmed_txs_leave_the_pool() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        let tx = build_tx(&w, vec![op], 0, 1_000, false);
        let txid = pool.insert(tx.clone(), &view, 10).unwrap();

        view.nonces.insert(w.address, 1);
        pool.remove_confirmed_block(&block_with(vec![tx]), &view);
        assert!(!pool.contains(&txid));
        assert!(pool.is_empty());
    }

    #[test]
    fn conflicting_tx_evicted_on_commit() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let w2 = wallet(0x62);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        let pool_tx = build_tx(&w, vec![op], 0, 1_000, false);
        let txid = pool.insert(pool_tx, &view, 10).unwrap();

        // A different tx spending the same outpoint confirms.
        let winner = build_tx(&w2, vec![op], 0, 2_000, false);
        pool.remove_confirmed_block(&block_with(vec![winner]), &view);
        assert!(!pool.contains(&txid));
    }

    #[test]
    fn stale_nonces_pruned_on_commit() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        let txid = pool.insert(build_tx(&w, vec![op], 0, 1_000, false), &view, 10).unwrap();

        // A block confirms some other tx of this sender with nonce 0.
        view.nonces.insert(w.address, 1);
        pool.remove_confirmed_block(&block_with(vec![]), &view);
        assert!(!pool.contains(&txid), "nonce-0 entry is stale once confirmed nonce is 1");
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    #[test]
    fn selection_orders_by_fee_rate() {
        let mut pool = Mempool::new(params());
        let view = {
            let mut v = TestView::new();
            let w1 = wallet(0x61);
            let w2 = wallet(0x62);
            let op1 = v.fund(1, w1.address, 10 * COIN);
            let op2 = v.fund(2, w2.address, 10 * COIN);
            pool.insert(build_tx(&w1, vec![op1], 0, 1_000, false), &v, 10).unwrap();
            pool.insert(build_tx(&w2, vec![op2], 0, 9_000, false), &v, 10).unwrap();
            v
        };

        let selected = pool.select_for_block(1 << 20, &view);
        assert_eq!(selected.len(), 2);
        assert!(selected[0].fee >= selected[1].fee);
        assert_eq!(selected[0].fee, 9_000);
    }

    #[test]
    fn selection_respects_nonce_order_despite_fees() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op0 = view.fund(1, w.address, 10 * COIN);
        let op1 = view.fund(2, w.address, 10 * COIN);

        // Child (nonce 1) pays a much higher fee than parent (nonce 0).
        pool.insert(build_tx(&w, vec![op0], 0, 1_000, false), &view, 10).unwrap();
        pool.insert(build_tx(&w, vec![op1], 1, 50_000, false), &view, 10).unwrap();

        let selected = pool.select_for_block(1 << 20, &view);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].tx.nonce, 0, "parent must precede child");
        assert_eq!(selected[1].tx.nonce, 1);
    }

    #[test]
    fn selection_respects_size_budget() {
        let mut pool = Mempool::new(params());
        let w1 = wallet(0x61);
        let w2 = wallet(0x62);
        let mut view = TestView::new();
        let op1 = view.fund(1, w1.address, 10 * COIN);
        let op2 = view.fund(2, w2.address, 10 * COIN);

        pool.insert(build_tx(&w1, vec![op1], 0, 9_000, false), &view, 10).unwrap();
        pool.insert(build_tx(&w2, vec![op2], 0, 1_000, false), &view, 10).unwrap();

        let one_tx_size = pool.iter().next().unwrap().size;
        let selected = pool.select_for_block(one_tx_size, &view);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].fee, 9_000, "budget keeps only the best rate");
    }

    // ------------------------------------------------------------------
    // Capacity and floor
    // ------------------------------------------------------------------

    fn tiny_pool_params() -> NetworkParams {
        let mut p = params();
        // Room for roughly two of our test transactions.
        p.mempool_max_bytes = 512;
        p
    }

    #[test]
    fn capacity_evicts_lowest_rate() {
        let mut pool = Mempool::new(tiny_pool_params());
        let mut view = TestView::new();
        let w1 = wallet(0x61);
        let w2 = wallet(0x62);
        let w3 = wallet(0x63);
        let op1 = view.fund(1, w1.address, 10 * COIN);
        let op2 = view.fund(2, w2.address, 10 * COIN);
        let op3 = view.fund(3, w3.address, 10 * COIN);

        let cheap = pool.insert(build_tx(&w1, vec![op1], 0, 1_000, false), &view, 10).unwrap();
        pool.insert(build_tx(&w2, vec![op2], 0, 5_000, false), &view, 10).unwrap();

        // Third admission overflows; the cheapest entry goes.
        pool.insert(build_tx(&w3, vec![op3], 0, 9_000, false), &view, 10).unwrap();
        assert!(!pool.contains(&cheap));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn eviction_floor_blocks_underpriced_admissions() {
        let mut pool = Mempool::new(tiny_pool_params());
        let mut view = TestView::new();
        let w1 = wallet(0x61);
        let w2 = wallet(0x62);
        let w3 = wallet(0x63);
        let w4 = wallet(0x64);
        let op1 = view.fund(1, w1.address, 10 * COIN);
        let op2 = view.fund(2, w2.address, 10 * COIN);
        let op3 = view.fund(3, w3.address, 10 * COIN);
        let op4 = view.fund(4, w4.address, 10 * COIN);

        pool.insert(build_tx(&w1, vec![op1], 0, 2_000, false), &view, 10).unwrap();
        pool.insert(build_tx(&w2, vec![op2], 0, 5_000, false), &view, 10).unwrap();
        // Evicts the 2_000 entry, setting the floor at its rate.
        pool.insert(build_tx(&w3, vec![op3], 0, 9_000, false), &view, 10).unwrap();

        // A new tx priced at (or below) the evicted rate is refused outright.
        assert!(matches!(
            pool.insert(build_tx(&w4, vec![op4], 0, 2_000, false), &view, 10),
            Err(MempoolError::BelowEvictionFloor { .. }) | Err(MempoolError::PoolFull)
        ));
    }

    #[test]
    fn ttl_expiry_drops_old_entries() {
        let mut p = params();
        p.mempool_ttl_s = 600;
        let mut pool = Mempool::new(p);
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        let txid = pool.insert(build_tx(&w, vec![op], 0, 1_000, false), &view, 10).unwrap();

        // Nothing expires yet.
        assert_eq!(pool.evict_expired(), 0);

        // Backdate the arrival past the TTL.
        pool.entries.get_mut(&txid).unwrap().arrival =
            Instant::now() - Duration::from_secs(601);
        assert_eq!(pool.evict_expired(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn pending_delta_tracks_spend_and_receive() {
        let mut pool = Mempool::new(params());
        let w = wallet(0x61);
        let mut view = TestView::new();
        let op = view.fund(1, w.address, 10 * COIN);

        let tx = build_tx(&w, vec![op], 0, 1_000, false);
        let recipient = tx.outputs[0].address;
        pool.insert(tx, &view, 10).unwrap();

        assert_eq!(pool.pending_delta(&w.address), -(COIN as i128 + 1_000));
        assert_eq!(pool.pending_delta(&recipient), COIN as i128);
    }
}
