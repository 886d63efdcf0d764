//! Proof-of-work miner: template assembly and a nonce-grinding worker pool.
//!
//! [`build_block_template`] assembles a candidate block from the mempool
//! (fee order under per-sender nonce order) with the coinbase paying
//! subsidy + fees to the miner address. The coinbase memo carries the
//! extra-nonce, so workers that exhaust their slice of the 64-bit header
//! nonce space rebuild the merkle root with a fresh extra-nonce and keep
//! going.
//!
//! Workers poll a shared template version between nonce chunks; publishing a
//! new template (on every chain tip change) makes them abandon the stale one
//! within a chunk. Found blocks are handed back over a channel and submitted
//! through the ordinary validated path — mining gets no shortcut.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use xai_core::address::Address;
use xai_core::block_validation;
use xai_core::difficulty;
use xai_core::error::XaiError;
use xai_core::mempool::Mempool;
use xai_core::merkle;
use xai_core::params::NetworkParams;
use xai_core::reward;
use xai_core::store::ChainStore;
use xai_core::types::{Block, BlockHeader, Hash256, Transaction, TxOutput};
use xai_core::validation::StoreView;

/// Nonces ground between template-version polls.
const NONCE_CHUNK: u64 = 8_192;

/// Serialized bytes reserved for the coinbase when filling from the mempool.
const COINBASE_RESERVE: usize = 512;

/// Build a candidate block on the current tip.
///
/// Transactions come from the mempool in fee-rate order under per-sender
/// nonce order; the coinbase mints exactly subsidy + fees to `miner`. The
/// header nonce starts at zero, ready for the worker pool.
pub fn build_block_template<S: ChainStore>(
    store: &S,
    mempool: &Mempool,
    params: &NetworkParams,
    miner: Address,
    now: u64,
) -> Result<Block, XaiError> {
    let (tip_height, tip_hash) = store
        .tip()?
        .ok_or_else(|| XaiError::Chain(xai_core::error::ChainError::EmptyChain))?;
    let height = tip_height + 1;

    let parent = store
        .get_block_header(&tip_hash)?
        .ok_or_else(|| XaiError::Storage(format!("missing tip header {tip_hash}")))?;

    let mut timestamps = Vec::new();
    for h in tip_height.saturating_sub(10)..=tip_height {
        if let Some(hash) = store.get_block_hash(h)? {
            if let Some(header) = store.get_block_header(&hash)? {
                timestamps.push(header.timestamp);
            }
        }
    }
    let mtp = block_validation::median_time_past(&timestamps);
    let timestamp = now.max(mtp + 1);

    let bits = difficulty::expected_bits(
        height,
        parent.difficulty_bits,
        params.retarget_interval,
        params.target_block_time_s,
        params.max_adjustment,
        params.pow_limit_bits,
        |h| {
            store
                .get_block_hash(h)
                .ok()
                .flatten()
                .and_then(|hash| store.get_block_header(&hash).ok().flatten())
                .map(|hdr| hdr.timestamp)
        },
    );

    let view = StoreView(store);
    let budget = params.max_block_bytes.saturating_sub(COINBASE_RESERVE);
    let selected = mempool.select_for_block(budget, &view);
    let total_fees: u64 = selected.iter().map(|e| e.fee).sum();
    let subsidy = reward::block_subsidy(params, height);
    let coinbase_value = subsidy.saturating_add(total_fees);

    let coinbase = Transaction {
        version: 1,
        inputs: vec![],
        outputs: if coinbase_value == 0 {
            vec![]
        } else {
            vec![TxOutput { address: miner, amount: coinbase_value }]
        },
        locktime: 0,
        sender: miner,
        sender_pubkey: [0u8; 33],
        signature: [0u8; 64],
        nonce: height,
        fee: 0,
        memo: Some("xn:0".to_string()),
        replaces_txid: None,
        rbf: false,
    };

    let mut transactions = Vec::with_capacity(1 + selected.len());
    transactions.push(coinbase);
    transactions.extend(selected.into_iter().map(|e| e.tx.clone()));

    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    Ok(Block {
        header: BlockHeader {
            version: 1,
            height,
            prev_hash: tip_hash,
            merkle_root: merkle::merkle_root(&txids),
            timestamp,
            difficulty_bits: bits,
            nonce: 0,
            miner,
        },
        transactions,
    })
}

/// Rewrite the coinbase extra-nonce and recompute the merkle root.
fn apply_extra_nonce(block: &mut Block, extra: u64) {
    block.transactions[0].memo = Some(format!("xn:{extra}"));
    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
    block.header.merkle_root = merkle::merkle_root(&txids);
}

struct Shared {
    /// Current template; `None` pauses the workers.
    template: RwLock<Option<Arc<Block>>>,
    /// Bumped on every template publish; workers abandon stale versions.
    version: AtomicU64,
    stop: AtomicBool,
}

/// Worker pool grinding proof-of-work over published templates.
pub struct Miner {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    threads: usize,
}

impl Miner {
    /// Spawn `threads` workers. Found blocks are sent on `found_tx`; the
    /// caller owns submitting them through the chain manager.
    pub fn spawn(threads: usize, found_tx: mpsc::UnboundedSender<Block>) -> Self {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            template: RwLock::new(None),
            version: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        });

        let workers = (0..threads)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let found = found_tx.clone();
                std::thread::Builder::new()
                    .name(format!("xai-miner-{worker_id}"))
                    .spawn(move || worker_loop(worker_id as u64, threads as u64, &shared, &found))
                    .expect("spawn miner worker")
            })
            .collect();

        info!(threads, "miner: workers started");
        Self { shared, workers, threads }
    }

    /// Publish a fresh template. Workers pick it up within one nonce chunk.
    pub fn set_template(&self, block: Block) {
        *self.shared.template.write() = Some(Arc::new(block));
        self.shared.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Pause mining until the next template.
    pub fn clear_template(&self) {
        *self.shared.template.write() = None;
        self.shared.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Stop all workers and wait for them to exit.
    pub fn shutdown(mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.version.fetch_add(1, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        info!("miner: workers stopped");
    }
}

fn worker_loop(
    worker_id: u64,
    stride: u64,
    shared: &Shared,
    found: &mpsc::UnboundedSender<Block>,
) {
    let mut extra_nonce: u64 = worker_id;

    while !shared.stop.load(Ordering::SeqCst) {
        let version = shared.version.load(Ordering::SeqCst);
        let Some(template) = shared.template.read().clone() else {
            std::thread::sleep(std::time::Duration::from_millis(20));
            continue;
        };

        let mut block = (*template).clone();
        apply_extra_nonce(&mut block, extra_nonce);

        // Partition the nonce space: worker k grinds k, k+stride, ...
        let mut nonce = worker_id;
        let mut exhausted = false;
        'grind: loop {
            for _ in 0..NONCE_CHUNK {
                block.header.nonce = nonce;
                if difficulty::check_pow(&block.hash(), block.header.difficulty_bits) {
                    debug!(height = block.header.height, nonce, extra_nonce, "miner: solution found");
                    let _ = found.send(block.clone());
                    break 'grind;
                }
                match nonce.checked_add(stride) {
                    Some(next) => nonce = next,
                    None => {
                        exhausted = true;
                        break 'grind;
                    }
                }
            }
            if shared.version.load(Ordering::SeqCst) != version
                || shared.stop.load(Ordering::SeqCst)
            {
                break 'grind;
            }
        }

        if exhausted {
            // Header nonces spent: bump the coinbase extra-nonce and retry.
            extra_nonce += stride;
            continue;
        }

        // Solution sent or template went stale: wait for a version change
        // rather than re-grinding the same puzzle.
        while shared.version.load(Ordering::SeqCst) == version
            && !shared.stop.load(Ordering::SeqCst)
        {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}

/// Grind a block's nonce in place until PoW passes or `max_nonce` is hit.
/// Test and tooling helper; the node uses the worker pool.
pub fn mine_block(block: &mut Block, max_nonce: u64) -> bool {
    for nonce in 0..=max_nonce {
        block.header.nonce = nonce;
        if difficulty::check_pow(&block.hash(), block.header.difficulty_bits) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use xai_core::address::Network;
    use xai_core::crypto::{self, KeyPair};
    use xai_core::store::MemoryChainStore;
    use xai_core::validation;

    fn params() -> NetworkParams {
        NetworkParams::regtest()
    }

    fn miner_address() -> Address {
        Address::from_hash160([0xAA; 20], Network::Regtest)
    }

    fn template_now(store: &MemoryChainStore, mempool: &Mempool) -> Block {
        build_block_template(store, mempool, &params(), miner_address(), 5_000_000_000).unwrap()
    }

    #[test]
    fn template_extends_tip_with_exact_coinbase() {
        let store = MemoryChainStore::with_genesis(params());
        let mempool = Mempool::new(params());
        let block = template_now(&store, &mempool);

        let (tip_height, tip_hash) = store.tip().unwrap().unwrap();
        assert_eq!(block.header.height, tip_height + 1);
        assert_eq!(block.header.prev_hash, tip_hash);
        assert_eq!(block.transactions.len(), 1);
        let cb = &block.transactions[0];
        assert!(cb.is_coinbase());
        assert_eq!(cb.nonce, block.header.height);
        assert_eq!(
            cb.total_output_value().unwrap(),
            reward::block_subsidy(&params(), block.header.height)
        );
    }

    #[test]
    fn template_includes_mempool_transactions_and_fees() {
        let p = params();
        let mut store = MemoryChainStore::with_genesis(p.clone());

        // Mine a spendable balance for a wallet: one block paying it, then
        // maturity blocks on top.
        let kp = KeyPair::from_secret_bytes(&[0x71; 32]).unwrap();
        let owner = Address::from_public_key(&kp.public_key(), Network::Regtest);
        let mut funding_txid = None;
        for _ in 0..=p.coinbase_maturity {
            let mut block = build_block_template(
                &store,
                &Mempool::new(p.clone()),
                &p,
                owner,
                5_000_000_000,
            )
            .unwrap();
            assert!(mine_block(&mut block, u64::MAX));
            funding_txid.get_or_insert(block.transactions[0].txid());
            store.connect_block(&block).unwrap();
        }

        let mut mempool = Mempool::new(p.clone());
        let subsidy = reward::block_subsidy(&p, 1);
        let mut tx = Transaction {
            version: 1,
            inputs: vec![xai_core::types::OutPoint { txid: funding_txid.unwrap(), vout: 0 }],
            outputs: vec![TxOutput {
                address: Address::from_hash160([0x33; 20], Network::Regtest),
                amount: subsidy - 2_000,
            }],
            locktime: 0,
            sender: owner,
            sender_pubkey: [0; 33],
            signature: [0; 64],
            nonce: 0,
            fee: 2_000,
            memo: None,
            replaces_txid: None,
            rbf: false,
        };
        crypto::sign_transaction(&mut tx, &kp);
        validation::validate_transaction_stateless(&tx, &p).unwrap();
        let tip_height = store.tip().unwrap().unwrap().0;
        mempool.insert(tx.clone(), &StoreView(&store), tip_height).unwrap();

        let block = template_now(&store, &mempool);
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[1].txid(), tx.txid());
        let expected = reward::block_subsidy(&p, block.header.height) + 2_000;
        assert_eq!(block.transactions[0].total_output_value().unwrap(), expected);
    }

    #[test]
    fn extra_nonce_changes_merkle_root_only() {
        let store = MemoryChainStore::with_genesis(params());
        let mempool = Mempool::new(params());
        let mut block = template_now(&store, &mempool);
        let root_before = block.header.merkle_root;
        let prev = block.header.prev_hash;

        apply_extra_nonce(&mut block, 42);
        assert_ne!(block.header.merkle_root, root_before);
        assert_eq!(block.header.prev_hash, prev);
        // Commitment stays consistent.
        let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
        assert_eq!(block.header.merkle_root, merkle::merkle_root(&txids));
    }

    #[test]
    fn mine_block_finds_regtest_solution() {
        let store = MemoryChainStore::with_genesis(params());
        let mempool = Mempool::new(params());
        let mut block = template_now(&store, &mempool);
        // Regtest accepts ~half of hashes; 10k nonces is overwhelming odds.
        assert!(mine_block(&mut block, 10_000));
        assert!(difficulty::check_pow(&block.hash(), block.header.difficulty_bits));
    }

    #[test]
    fn mined_template_passes_full_validation() {
        let mut store = MemoryChainStore::with_genesis(params());
        let mempool = Mempool::new(params());
        let mut block = template_now(&store, &mempool);
        assert!(mine_block(&mut block, u64::MAX));
        store.connect_block(&block).unwrap();
        assert_eq!(store.tip().unwrap().unwrap().0, 1);
    }

    #[tokio::test]
    async fn worker_pool_finds_and_reports_blocks() {
        let store = MemoryChainStore::with_genesis(params());
        let mempool = Mempool::new(params());
        let template = template_now(&store, &mempool);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(2, tx);
        miner.set_template(template.clone());

        let found = tokio::time::timeout(std::time::Duration::from_secs(30), rx.recv())
            .await
            .expect("a regtest solution arrives quickly")
            .expect("channel open");
        assert_eq!(found.header.height, template.header.height);
        assert!(difficulty::check_pow(&found.hash(), found.header.difficulty_bits));
        miner.shutdown();
    }

    #[test]
    fn shutdown_joins_workers() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(3, tx);
        assert_eq!(miner.threads(), 3);
        miner.shutdown(); // must not hang
    }
}
