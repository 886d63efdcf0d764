//! Chain state storage interface and in-memory implementation.
//!
//! [`ChainStore`] is the single mutation surface for the active chain: the
//! chain manager exclusively drives `connect_block` / `disconnect_tip`, and
//! every other component reads. The [`MemoryChainStore`] backs unit tests;
//! the production node uses the file-based engine in `xai-node`.
//!
//! Blocks passed to [`ChainStore::connect_block`] must already be validated;
//! the store performs only linkage sanity checks (height, parent hash,
//! duplicates) and the atomic UTXO application.

use std::collections::HashMap;

use crate::address::Address;
use crate::codec::{Encodable, Reader, Writer};
use crate::error::{ChainError, CodecError, XaiError};
use crate::genesis;
use crate::params::NetworkParams;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, UtxoEntry};
use crate::utxo::{BlockDeltas, UtxoSet};

/// Whether an address history entry spent or received funds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One row of an address's transaction history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressHistoryEntry {
    pub txid: Hash256,
    pub height: u64,
    pub direction: Direction,
}

/// A pinned (height, block hash, UTXO root) tuple written every
/// `checkpoint_interval` blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u64,
    pub block_hash: Hash256,
    pub utxo_root: Hash256,
}

impl Encodable for Checkpoint {
    fn encode_into(&self, w: &mut Writer) {
        w.put_u64(self.height);
        self.block_hash.encode_into(w);
        self.utxo_root.encode_into(w);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            height: r.get_u64()?,
            block_hash: Hash256::decode_from(r)?,
            utxo_root: Hash256::decode_from(r)?,
        })
    }
}

/// Mutable chain state storage.
///
/// Not thread-safe by itself — the node wraps the store in a `RwLock`, with
/// the chain manager holding the only write path.
pub trait ChainStore: Send + Sync {
    /// Connect a validated block at the tip.
    ///
    /// Applies the block to the UTXO set atomically, updates the nonce and
    /// address indexes, stores the block, and advances the tip. Returns the
    /// deltas that were applied (the WAL record).
    fn connect_block(&mut self, block: &Block) -> Result<BlockDeltas, XaiError>;

    /// Disconnect the tip block, reverting its UTXO and index changes.
    ///
    /// Blocks must be reverted newest-first; the WAL enforces this. Returns
    /// the disconnected block so its transactions can go back to the mempool.
    fn disconnect_tip(&mut self) -> Result<Block, XaiError>;

    /// Current tip as `(height, block_hash)`, or `None` before genesis.
    fn tip(&self) -> Result<Option<(u64, Hash256)>, XaiError>;

    /// Look up a UTXO by outpoint. `None` if spent or unknown.
    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, XaiError>;

    /// Next expected nonce for a sender, from confirmed transactions only.
    fn next_nonce(&self, address: &Address) -> Result<u64, XaiError>;

    /// Get a full block on the active chain by hash.
    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, XaiError>;

    /// Get a header on the active chain by hash.
    fn get_block_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, XaiError>;

    /// Hash of the active-chain block at `height`.
    fn get_block_hash(&self, height: u64) -> Result<Option<Hash256>, XaiError>;

    /// Number of unspent outputs.
    fn utxo_count(&self) -> usize;

    /// Sum of all unspent amounts.
    fn total_utxo_amount(&self) -> u64;

    /// Merkle root of the UTXO set.
    fn utxo_root(&self) -> Hash256;

    /// Paginated history for an address, newest first.
    fn get_address_history(
        &self,
        address: &Address,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AddressHistoryEntry>, XaiError>;

    /// The most recent checkpoint, if any.
    fn latest_checkpoint(&self) -> Result<Option<Checkpoint>, XaiError> {
        Ok(None)
    }

    /// Whether a block hash is on the active chain.
    fn contains_block(&self, hash: &Hash256) -> Result<bool, XaiError> {
        Ok(self.get_block_header(hash)?.is_some())
    }

    /// Convenience: full block by height.
    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, XaiError> {
        match self.get_block_hash(height)? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }
}

/// Undo data for one connected block.
struct BlockUndo {
    deltas: BlockDeltas,
    /// `(sender, previous next_nonce)` pairs, first-touch order.
    nonce_undo: Vec<(Address, u64)>,
}

/// In-memory chain state storage for testing.
///
/// Everything lives in `HashMap`s with no persistence and unbounded undo
/// retention.
pub struct MemoryChainStore {
    params: NetworkParams,
    utxos: UtxoSet,
    blocks: HashMap<Hash256, Block>,
    height_to_hash: HashMap<u64, Hash256>,
    undo: HashMap<Hash256, BlockUndo>,
    nonces: HashMap<Address, u64>,
    history: HashMap<Address, Vec<AddressHistoryEntry>>,
    checkpoints: Vec<Checkpoint>,
    tip: Option<(u64, Hash256)>,
}

impl MemoryChainStore {
    /// Create an empty store (no genesis).
    pub fn new(params: NetworkParams) -> Self {
        Self {
            params,
            utxos: UtxoSet::new(),
            blocks: HashMap::new(),
            height_to_hash: HashMap::new(),
            undo: HashMap::new(),
            nonces: HashMap::new(),
            history: HashMap::new(),
            checkpoints: Vec::new(),
            tip: None,
        }
    }

    /// Create a store with the network's genesis block connected.
    pub fn with_genesis(params: NetworkParams) -> Self {
        let mut store = Self::new(params.clone());
        let genesis = genesis::genesis_block(&params);
        store.connect_block(&genesis).expect("genesis connects on empty store");
        store
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Record history rows and nonce-index updates for one connected block.
    fn index_block(&mut self, block: &Block, undo: &mut BlockUndo) {
        for tx in &block.transactions {
            let txid = tx.txid();
            let height = block.header.height;

            if !tx.is_coinbase() {
                let next = tx.nonce + 1;
                let prev = self.nonces.get(&tx.sender).copied().unwrap_or(0);
                if undo.nonce_undo.iter().all(|(a, _)| *a != tx.sender) {
                    undo.nonce_undo.push((tx.sender, prev));
                }
                if next > prev {
                    self.nonces.insert(tx.sender, next);
                }
                self.history.entry(tx.sender).or_default().push(AddressHistoryEntry {
                    txid,
                    height,
                    direction: Direction::Sent,
                });
            }
            for out in &tx.outputs {
                self.history.entry(out.address).or_default().push(AddressHistoryEntry {
                    txid,
                    height,
                    direction: Direction::Received,
                });
            }
        }
    }

    fn unindex_block(&mut self, block: &Block, undo: &BlockUndo) {
        for (address, prev) in &undo.nonce_undo {
            if *prev == 0 {
                self.nonces.remove(address);
            } else {
                self.nonces.insert(*address, *prev);
            }
        }
        for tx in &block.transactions {
            let txid = tx.txid();
            if !tx.is_coinbase() {
                if let Some(rows) = self.history.get_mut(&tx.sender) {
                    rows.retain(|r| r.txid != txid);
                }
            }
            for out in &tx.outputs {
                if let Some(rows) = self.history.get_mut(&out.address) {
                    rows.retain(|r| r.txid != txid);
                }
            }
        }
    }
}

impl ChainStore for MemoryChainStore {
    fn connect_block(&mut self, block: &Block) -> Result<BlockDeltas, XaiError> {
        let height = block.header.height;

        match self.tip {
            None => {
                if height != 0 {
                    return Err(ChainError::HeightMismatch { expected: 0, got: height }.into());
                }
            }
            Some((tip_height, tip_hash)) => {
                if height != tip_height + 1 {
                    return Err(ChainError::HeightMismatch {
                        expected: tip_height + 1,
                        got: height,
                    }
                    .into());
                }
                if block.header.prev_hash != tip_hash {
                    return Err(ChainError::Block(
                        crate::error::BlockError::PrevHashMismatch,
                    )
                    .into());
                }
            }
        }

        let block_hash = block.hash();
        if self.blocks.contains_key(&block_hash) {
            return Err(ChainError::DuplicateBlock(block_hash.to_string()).into());
        }

        let deltas = self
            .utxos
            .apply_block(block, self.params.coinbase_maturity)
            .map_err(ChainError::from)?;

        let mut undo = BlockUndo { deltas: deltas.clone(), nonce_undo: Vec::new() };
        self.index_block(block, &mut undo);

        self.blocks.insert(block_hash, block.clone());
        self.height_to_hash.insert(height, block_hash);
        self.undo.insert(block_hash, undo);
        self.tip = Some((height, block_hash));

        if self.params.checkpoint_interval > 0
            && height > 0
            && height % self.params.checkpoint_interval == 0
        {
            self.checkpoints.push(Checkpoint {
                height,
                block_hash,
                utxo_root: self.utxos.utxo_root(),
            });
        }

        Ok(deltas)
    }

    fn disconnect_tip(&mut self) -> Result<Block, XaiError> {
        let (tip_height, tip_hash) = self.tip.ok_or(ChainError::EmptyChain)?;

        let block = self
            .blocks
            .get(&tip_hash)
            .cloned()
            .ok_or_else(|| ChainError::BlockNotFound(tip_hash.to_string()))?;
        let undo = self
            .undo
            .remove(&tip_hash)
            .ok_or_else(|| ChainError::UndoDataMissing(tip_hash.to_string()))?;

        self.utxos.revert_deltas(&undo.deltas);
        self.unindex_block(&block, &undo);

        self.blocks.remove(&tip_hash);
        self.height_to_hash.remove(&tip_height);
        self.checkpoints.retain(|cp| cp.height < tip_height);

        self.tip = if tip_height == 0 {
            None
        } else {
            Some((tip_height - 1, block.header.prev_hash))
        };

        Ok(block)
    }

    fn tip(&self) -> Result<Option<(u64, Hash256)>, XaiError> {
        Ok(self.tip)
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, XaiError> {
        Ok(self.utxos.get(outpoint).cloned())
    }

    fn next_nonce(&self, address: &Address) -> Result<u64, XaiError> {
        Ok(self.nonces.get(address).copied().unwrap_or(0))
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, XaiError> {
        Ok(self.blocks.get(hash).cloned())
    }

    fn get_block_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, XaiError> {
        Ok(self.blocks.get(hash).map(|b| b.header.clone()))
    }

    fn get_block_hash(&self, height: u64) -> Result<Option<Hash256>, XaiError> {
        Ok(self.height_to_hash.get(&height).copied())
    }

    fn utxo_count(&self) -> usize {
        self.utxos.len()
    }

    fn total_utxo_amount(&self) -> u64 {
        self.utxos.total_amount()
    }

    fn utxo_root(&self) -> Hash256 {
        self.utxos.utxo_root()
    }

    fn get_address_history(
        &self,
        address: &Address,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AddressHistoryEntry>, XaiError> {
        let rows = self.history.get(address).map(Vec::as_slice).unwrap_or(&[]);
        Ok(rows.iter().rev().skip(offset).take(limit).cloned().collect())
    }

    fn latest_checkpoint(&self) -> Result<Option<Checkpoint>, XaiError> {
        Ok(self.checkpoints.last().copied())
    }
}
