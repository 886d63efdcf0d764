//! Chain manager: tip selection, fork choice, and reorganization.
//!
//! The manager is the single writer of chain state. Incoming blocks route
//! three ways: parent unknown → orphan pool (caller requests ancestors);
//! parent known but off-tip → side branch, reorganizing only when the branch
//! carries strictly more cumulative work (ties: lowest hash, then earliest
//! arrival); parent at tip → validate and connect.
//!
//! A reorganization reverts committed blocks down to the fork point using the
//! store's undo records, then applies the new branch upward. If any branch
//! block fails validation the whole reorg is rolled back and the pre-reorg
//! tip restored. Depth is capped by `max_reorg_depth`, and no reorg may cross
//! the newest UTXO checkpoint.
//!
//! Commits and reverts are published on a broadcast bus; subscribers (P2P,
//! miner, mempool maintenance) never hold a handle back into the manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn};

use xai_core::block_validation::{self, BlockContext};
use xai_core::difficulty::{self, ChainWork};
use xai_core::error::{BlockError, ChainError, XaiError};
use xai_core::params::NetworkParams;
use xai_core::reward;
use xai_core::store::ChainStore;
use xai_core::types::{Block, BlockHeader, Hash256};
use xai_core::validation::StoreView;

/// Maximum orphan blocks held while their ancestors are fetched.
const MAX_ORPHAN_BLOCKS: usize = 128;
/// Seconds after which an orphan is considered stale and evicted.
const ORPHAN_EXPIRY_SECS: u64 = 600;

/// Chain manager lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Downloading and validating headers from peers.
    SyncingHeaders,
    /// Downloading block bodies along the chosen header chain.
    SyncingBlocks,
    /// Caught up; processing live gossip.
    Active,
    /// A reorganization is in flight.
    Reorganizing,
}

/// Published on the event bus for every chain mutation.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    /// A block was committed at the tip.
    Committed(Arc<Block>),
    /// A block was reverted during a reorganization.
    Reverted(Arc<Block>),
}

/// Result of handing a block to [`ChainManager::process_block`].
#[derive(Clone, Debug)]
pub enum BlockOutcome {
    /// Connected at the tip.
    Committed,
    /// Already committed or already a known side block; nothing changed.
    AlreadyKnown,
    /// Stored on a side branch with less work than the active tip.
    SideBranch,
    /// Parent missing; stored as an orphan. Ask peers for the parent.
    Orphaned { missing_parent: Hash256 },
    /// The block's branch won fork choice and the chain switched to it.
    Reorganized { reverted: Vec<Arc<Block>>, applied: Vec<Arc<Block>> },
}

/// Per-block metadata kept for every block the manager has seen and linked.
#[derive(Clone, Debug)]
struct IndexEntry {
    header: BlockHeader,
    cumulative_work: ChainWork,
    /// Monotone first-seen sequence; the fork-choice tie-breaker, so replays
    /// and restarts stay deterministic without wall clocks.
    arrival_seq: u64,
}

/// Chain manager over a [`ChainStore`].
pub struct ChainManager<S: ChainStore> {
    store: Arc<RwLock<S>>,
    params: NetworkParams,
    /// All linked blocks (active and side) by hash.
    index: HashMap<Hash256, IndexEntry>,
    /// Bodies of side-branch blocks not in the store.
    side_blocks: HashMap<Hash256, Block>,
    /// Orphans keyed by their missing parent hash.
    orphans: HashMap<Hash256, Vec<(Block, Instant)>>,
    state: SyncState,
    arrival_counter: u64,
    events: broadcast::Sender<ChainEvent>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl<S: ChainStore> ChainManager<S> {
    /// Build a manager over a store that already contains at least genesis.
    pub fn new(store: Arc<RwLock<S>>, params: NetworkParams) -> Result<Self, XaiError> {
        Self::with_clock(store, params, || {
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
        })
    }

    /// Like [`ChainManager::new`] with an injectable clock for tests.
    pub fn with_clock(
        store: Arc<RwLock<S>>,
        params: NetworkParams,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Result<Self, XaiError> {
        let (events, _) = broadcast::channel(1024);
        let mut manager = Self {
            store,
            params,
            index: HashMap::new(),
            side_blocks: HashMap::new(),
            orphans: HashMap::new(),
            state: SyncState::SyncingHeaders,
            arrival_counter: 0,
            events,
            clock: Box::new(clock),
        };
        manager.rebuild_index()?;
        manager.state = SyncState::Active;
        Ok(manager)
    }

    /// Rebuild the in-memory block index from the store's active chain.
    fn rebuild_index(&mut self) -> Result<(), XaiError> {
        let store = self.store.read();
        let Some((tip_height, _)) = store.tip()? else {
            return Err(XaiError::Chain(ChainError::EmptyChain));
        };
        let mut work = ChainWork::ZERO;
        for height in 0..=tip_height {
            let hash = store
                .get_block_hash(height)?
                .ok_or_else(|| XaiError::Storage(format!("missing block at height {height}")))?;
            let header = store
                .get_block_header(&hash)?
                .ok_or_else(|| XaiError::Storage(format!("missing header {hash}")))?;
            work = work.add(&ChainWork::from_bits(header.difficulty_bits).unwrap_or(ChainWork::ZERO));
            let seq = self.arrival_counter;
            self.arrival_counter += 1;
            self.index.insert(hash, IndexEntry { header, cumulative_work: work, arrival_seq: seq });
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Set the lifecycle state (driven by the sync engine).
    pub fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            debug!(?state, "chain: state change");
            self.state = state;
        }
    }

    /// Subscribe to commit/revert events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Cumulative work of the active tip.
    pub fn tip_work(&self) -> Result<ChainWork, XaiError> {
        let (_, tip_hash) = self.tip()?;
        Ok(self.index.get(&tip_hash).map(|e| e.cumulative_work).unwrap_or(ChainWork::ZERO))
    }

    /// Active tip as `(height, hash)`.
    pub fn tip(&self) -> Result<(u64, Hash256), XaiError> {
        self.store
            .read()
            .tip()?
            .ok_or_else(|| XaiError::Chain(ChainError::EmptyChain))
    }

    /// Number of orphans currently held.
    pub fn orphan_count(&self) -> usize {
        self.orphans.values().map(Vec::len).sum()
    }

    /// Process a block from any source (miner, gossip, sync).
    ///
    /// Submitting an already-committed block is a no-op returning
    /// [`BlockOutcome::AlreadyKnown`].
    pub fn process_block(&mut self, block: Block) -> Result<BlockOutcome, XaiError> {
        let block_hash = block.hash();
        let _span =
            info_span!("process_block", %block_hash, height = block.header.height).entered();

        if self.index.contains_key(&block_hash) {
            return Ok(BlockOutcome::AlreadyKnown);
        }

        self.evict_stale_orphans();

        let (tip_height, tip_hash) = self.tip()?;

        // Fast path: extends the active tip.
        if block.header.prev_hash == tip_hash {
            self.validate_and_connect(&block)?;
            let outcome = BlockOutcome::Committed;
            self.connect_pending_orphans(block_hash)?;
            return Ok(outcome);
        }

        // Parent unknown entirely: orphan.
        let Some(parent) = self.index.get(&block.header.prev_hash).cloned() else {
            let missing = block.header.prev_hash;
            self.stash_orphan(block);
            return Ok(BlockOutcome::Orphaned { missing_parent: missing });
        };

        // Known parent off the tip: a fork. Cheap sanity before storing.
        if block.header.height != parent.header.height + 1 {
            return Err(XaiError::Block(BlockError::HeightMismatch {
                expected: parent.header.height + 1,
                got: block.header.height,
            }));
        }
        if !difficulty::check_pow(&block_hash, block.header.difficulty_bits) {
            return Err(XaiError::Block(BlockError::InvalidPoW));
        }

        let block_work =
            ChainWork::from_bits(block.header.difficulty_bits).ok_or(XaiError::Block(BlockError::InvalidPoW))?;
        let candidate_work = parent.cumulative_work.add(&block_work);
        let seq = self.arrival_counter;
        self.arrival_counter += 1;
        self.index.insert(
            block_hash,
            IndexEntry { header: block.header.clone(), cumulative_work: candidate_work, arrival_seq: seq },
        );
        self.side_blocks.insert(block_hash, block.clone());

        let tip_entry = self.index.get(&tip_hash).expect("tip indexed");
        if !Self::candidate_wins(
            candidate_work,
            block_hash,
            seq,
            tip_entry.cumulative_work,
            tip_hash,
            tip_entry.arrival_seq,
        ) {
            debug!(%block_hash, "chain: stored side branch");
            self.prune_side_blocks(tip_height);
            // A waiting descendant may extend this branch past the tip.
            self.connect_pending_orphans(block_hash)?;
            return Ok(BlockOutcome::SideBranch);
        }

        let outcome = self.reorganize_to(block_hash)?;
        self.connect_pending_orphans(block_hash)?;
        Ok(outcome)
    }

    /// Fork-choice comparison: more work wins; on equal work the lower block
    /// hash wins; on equal hash-order the earlier arrival wins.
    fn candidate_wins(
        cand_work: ChainWork,
        cand_hash: Hash256,
        cand_seq: u64,
        tip_work: ChainWork,
        tip_hash: Hash256,
        tip_seq: u64,
    ) -> bool {
        (cand_work, std::cmp::Reverse(cand_hash), std::cmp::Reverse(cand_seq))
            > (tip_work, std::cmp::Reverse(tip_hash), std::cmp::Reverse(tip_seq))
    }

    /// Validate `block` against the current tip context and commit it.
    fn validate_and_connect(&mut self, block: &Block) -> Result<(), XaiError> {
        let ctx = self.context_for_next(block.header.height)?;
        {
            let store = self.store.read();
            block_validation::validate_block(block, &ctx, &StoreView(&*store), &self.params)
                .map_err(ChainError::from)?;
        }

        let block_hash = block.hash();
        {
            let mut store = self.store.write();
            store.connect_block(block)?;
        }

        let parent_work = self
            .index
            .get(&block.header.prev_hash)
            .map(|e| e.cumulative_work)
            .unwrap_or(ChainWork::ZERO);
        let work = parent_work
            .add(&ChainWork::from_bits(block.header.difficulty_bits).unwrap_or(ChainWork::ZERO));
        let seq = self.arrival_counter;
        self.arrival_counter += 1;
        self.index.insert(
            block_hash,
            IndexEntry { header: block.header.clone(), cumulative_work: work, arrival_seq: seq },
        );
        self.side_blocks.remove(&block_hash);

        info!(height = block.header.height, %block_hash, "chain: block committed");
        let _ = self.events.send(ChainEvent::Committed(Arc::new(block.clone())));
        Ok(())
    }

    /// Build the validation context for a block at `height` extending the
    /// current tip.
    fn context_for_next(&self, height: u64) -> Result<BlockContext, XaiError> {
        let store = self.store.read();
        let (tip_height, tip_hash) = store
            .tip()?
            .ok_or_else(|| XaiError::Chain(ChainError::EmptyChain))?;
        let parent_header = store
            .get_block_header(&tip_hash)?
            .ok_or_else(|| XaiError::Storage(format!("missing tip header {tip_hash}")))?;

        let mut timestamps = Vec::new();
        let span_start = tip_height.saturating_sub(10);
        for h in span_start..=tip_height {
            if let Some(hash) = store.get_block_hash(h)? {
                if let Some(header) = store.get_block_header(&hash)? {
                    timestamps.push(header.timestamp);
                }
            }
        }

        let expected_bits = difficulty::expected_bits(
            height,
            parent_header.difficulty_bits,
            self.params.retarget_interval,
            self.params.target_block_time_s,
            self.params.max_adjustment,
            self.params.pow_limit_bits,
            |h| {
                store
                    .get_block_hash(h)
                    .ok()
                    .flatten()
                    .and_then(|hash| store.get_block_header(&hash).ok().flatten())
                    .map(|hdr| hdr.timestamp)
            },
        );

        Ok(BlockContext {
            height,
            prev_hash: tip_hash,
            expected_bits,
            median_time_past: block_validation::median_time_past(&timestamps),
            now: (self.clock)(),
            expected_subsidy: reward::block_subsidy(&self.params, height),
        })
    }

    /// Switch the active chain to the branch ending at `new_tip_hash`.
    fn reorganize_to(&mut self, new_tip_hash: Hash256) -> Result<BlockOutcome, XaiError> {
        let (tip_height, _) = self.tip()?;

        // Walk the candidate branch down to the fork point on the active chain.
        let mut branch: Vec<Hash256> = Vec::new();
        let mut cursor = new_tip_hash;
        let fork_height = loop {
            let entry = self
                .index
                .get(&cursor)
                .ok_or_else(|| XaiError::Chain(ChainError::BlockNotFound(cursor.to_string())))?;
            let on_active = self
                .store
                .read()
                .get_block_hash(entry.header.height)?
                .is_some_and(|h| h == cursor);
            if on_active {
                break entry.header.height;
            }
            branch.push(cursor);
            cursor = entry.header.prev_hash;
        };
        branch.reverse();

        let depth = tip_height.saturating_sub(fork_height);
        if depth > self.params.max_reorg_depth {
            warn!(depth, max = self.params.max_reorg_depth, "chain: refusing deep reorg");
            return Err(XaiError::Chain(ChainError::ReorgTooDeep {
                depth,
                max: self.params.max_reorg_depth,
            }));
        }
        if let Some(cp) = self.store.read().latest_checkpoint()? {
            if fork_height < cp.height {
                return Err(XaiError::Chain(ChainError::CheckpointMismatch(cp.height)));
            }
        }

        info!(fork_height, depth, blocks = branch.len(), "chain: reorganizing");
        self.state = SyncState::Reorganizing;

        // Revert down to the fork point.
        let mut reverted: Vec<Arc<Block>> = Vec::new();
        while self.tip()?.0 > fork_height {
            let block = self.store.write().disconnect_tip()?;
            let hash = block.hash();
            let arc = Arc::new(block);
            self.side_blocks.insert(hash, (*arc).clone());
            reverted.push(Arc::clone(&arc));
            let _ = self.events.send(ChainEvent::Reverted(arc));
        }

        // Apply the branch upward; abort and restore on any failure.
        let mut applied: Vec<Arc<Block>> = Vec::new();
        for hash in &branch {
            let block = self
                .side_blocks
                .get(hash)
                .cloned()
                .ok_or_else(|| XaiError::Chain(ChainError::BlockNotFound(hash.to_string())))?;
            if let Err(e) = self.validate_and_connect(&block) {
                warn!(%hash, error = %e, "chain: reorg branch block invalid, restoring");
                self.restore_after_failed_reorg(fork_height, &applied, &reverted)?;
                self.state = SyncState::Active;
                // Drop the poisoned branch from the index so it cannot win again.
                for h in &branch {
                    self.index.remove(h);
                    self.side_blocks.remove(h);
                }
                return Err(XaiError::Chain(ChainError::ReorgAborted(e.to_string())));
            }
            applied.push(Arc::new(block));
        }

        self.state = SyncState::Active;
        self.prune_side_blocks(self.tip()?.0);
        info!(new_tip = %new_tip_hash, "chain: reorganization complete");
        Ok(BlockOutcome::Reorganized { reverted, applied })
    }

    /// Undo a partially-applied reorg and reconnect the previously-active
    /// blocks. The reverted blocks were valid minutes ago against exactly the
    /// state we are restoring, so reconnection cannot fail.
    fn restore_after_failed_reorg(
        &mut self,
        fork_height: u64,
        applied: &[Arc<Block>],
        reverted: &[Arc<Block>],
    ) -> Result<(), XaiError> {
        for _ in applied {
            let block = self.store.write().disconnect_tip()?;
            let hash = block.hash();
            let arc = Arc::new(block);
            self.side_blocks.insert(hash, (*arc).clone());
            let _ = self.events.send(ChainEvent::Reverted(arc));
        }
        debug_assert_eq!(self.tip()?.0, fork_height);
        for block in reverted.iter().rev() {
            self.validate_and_connect(block)?;
        }
        Ok(())
    }

    /// Store an orphan, evicting the oldest when full.
    fn stash_orphan(&mut self, block: Block) {
        if self.orphan_count() >= MAX_ORPHAN_BLOCKS {
            // Drop the oldest orphan across all buckets.
            if let Some(key) = self
                .orphans
                .iter()
                .filter_map(|(k, v)| v.first().map(|(_, t)| (*k, *t)))
                .min_by_key(|(_, t)| *t)
                .map(|(k, _)| k)
            {
                if let Some(bucket) = self.orphans.get_mut(&key) {
                    bucket.remove(0);
                    if bucket.is_empty() {
                        self.orphans.remove(&key);
                    }
                }
            }
        }
        debug!(parent = %block.header.prev_hash, "chain: stored orphan");
        self.orphans
            .entry(block.header.prev_hash)
            .or_default()
            .push((block, Instant::now()));
    }

    /// Connect any orphans whose missing parent just arrived.
    fn connect_pending_orphans(&mut self, parent_hash: Hash256) -> Result<(), XaiError> {
        let mut queue = vec![parent_hash];
        while let Some(parent) = queue.pop() {
            let Some(bucket) = self.orphans.remove(&parent) else { continue };
            for (orphan, _) in bucket {
                let hash = orphan.hash();
                match self.process_block(orphan) {
                    Ok(BlockOutcome::Committed | BlockOutcome::Reorganized { .. }) => {
                        queue.push(hash);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(%hash, error = %e, "chain: queued orphan rejected"),
                }
            }
        }
        Ok(())
    }

    fn evict_stale_orphans(&mut self) {
        self.orphans.retain(|_, bucket| {
            bucket.retain(|(_, stored)| stored.elapsed().as_secs() < ORPHAN_EXPIRY_SECS);
            !bucket.is_empty()
        });
    }

    /// Forget side-branch bodies too deep below the tip to ever win.
    fn prune_side_blocks(&mut self, tip_height: u64) {
        let floor = tip_height.saturating_sub(self.params.wal_retention());
        let index = &self.index;
        self.side_blocks.retain(|hash, _| {
            index.get(hash).map(|e| e.header.height >= floor).unwrap_or(false)
        });
    }
}
