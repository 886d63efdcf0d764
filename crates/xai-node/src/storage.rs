//! File-backed persistent chain storage.
//!
//! Layout under the chain data directory:
//!
//! ```text
//! blocks/NNNNNN.blk   one canonical-encoded block per active-chain height
//! blocks/hash.idx     append-only add/remove records: block hash → height
//! wal.log             write-ahead records, fsynced before a block commits
//! utxo/snapshot.bin   UTXO set + nonce index at the last checkpoint height
//! utxo/delta.log      per-block records since the snapshot
//! checkpoints/N.cp    (height, block hash, UTXO merkle root) pins
//! addr_index/XX.idx   256 buckets of per-address history records
//! ```
//!
//! Commit order makes `append` atomic: the WAL record is written and fsynced
//! first, then the block file, then the indexes. A crash between those steps
//! leaves a WAL tail whose block file is missing or wrong — startup reverts
//! such tail records, landing on the last fully-committed block. A block
//! file that fails hash verification deeper than the WAL window is
//! unrecoverable corruption: the store refuses to start until the operator
//! reindexes or resyncs.
//!
//! All record files use the same framing: `len(u32 LE) || check(4 bytes of
//! sha256d) || payload`, so torn tails are detected everywhere.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use xai_core::address::Address;
use xai_core::codec::{Encodable, Reader, Writer};
use xai_core::error::{ChainError, CodecError, XaiError};
use xai_core::genesis;
use xai_core::params::NetworkParams;
use xai_core::store::{AddressHistoryEntry, ChainStore, Checkpoint, Direction};
use xai_core::types::{Block, BlockHeader, Hash256, OutPoint, UtxoEntry};
use xai_core::utxo::{BlockDeltas, UtxoSet};

const BLOCKS_DIR: &str = "blocks";
const UTXO_DIR: &str = "utxo";
const CHECKPOINTS_DIR: &str = "checkpoints";
const ADDR_INDEX_DIR: &str = "addr_index";
const WAL_FILE: &str = "wal.log";
const HASH_INDEX_FILE: &str = "hash.idx";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const DELTA_FILE: &str = "delta.log";

/// One write-ahead record: everything needed to revert a committed block.
#[derive(Clone, Debug, PartialEq, Eq)]
struct WalRecord {
    height: u64,
    deltas: BlockDeltas,
    /// `(sender, new next_nonce)` applied by this block.
    nonce_set: Vec<(Address, u64)>,
    /// `(sender, previous next_nonce)` for reverting, first-touch order.
    nonce_undo: Vec<(Address, u64)>,
}

fn encode_nonce_pairs(w: &mut Writer, pairs: &[(Address, u64)]) {
    w.put_varint(pairs.len() as u64);
    for (address, nonce) in pairs {
        address.encode_into(w);
        w.put_u64(*nonce);
    }
}

fn decode_nonce_pairs(r: &mut Reader<'_>) -> Result<Vec<(Address, u64)>, CodecError> {
    let count = r.get_varint()?;
    if count > r.remaining() as u64 {
        return Err(CodecError::LengthOutOfBounds { len: count, remaining: r.remaining() });
    }
    let mut pairs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        pairs.push((Address::decode_from(r)?, r.get_u64()?));
    }
    Ok(pairs)
}

impl Encodable for WalRecord {
    fn encode_into(&self, w: &mut Writer) {
        w.put_u64(self.height);
        self.deltas.encode_into(w);
        encode_nonce_pairs(w, &self.nonce_set);
        encode_nonce_pairs(w, &self.nonce_undo);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            height: r.get_u64()?,
            deltas: BlockDeltas::decode_from(r)?,
            nonce_set: decode_nonce_pairs(r)?,
            nonce_undo: decode_nonce_pairs(r)?,
        })
    }
}

/// A history row as stored in an address-index bucket.
struct AddrIndexRecord {
    add: bool,
    address: Address,
    entry: AddressHistoryEntry,
}

impl Encodable for AddrIndexRecord {
    fn encode_into(&self, w: &mut Writer) {
        w.put_bool(self.add);
        self.address.encode_into(w);
        self.entry.txid.encode_into(w);
        w.put_u64(self.entry.height);
        w.put_bool(matches!(self.entry.direction, Direction::Sent));
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            add: r.get_bool()?,
            address: Address::decode_from(r)?,
            entry: AddressHistoryEntry {
                txid: Hash256::decode_from(r)?,
                height: r.get_u64()?,
                direction: if r.get_bool()? { Direction::Sent } else { Direction::Received },
            },
        })
    }
}

/// Hash-index record: maps a block hash to its active-chain height.
struct HashIndexRecord {
    add: bool,
    hash: Hash256,
    height: u64,
}

impl Encodable for HashIndexRecord {
    fn encode_into(&self, w: &mut Writer) {
        w.put_bool(self.add);
        self.hash.encode_into(w);
        w.put_u64(self.height);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self { add: r.get_bool()?, hash: Hash256::decode_from(r)?, height: r.get_u64()? })
    }
}

// --- record-file framing -------------------------------------------------

fn frame_record(payload: &[u8]) -> Vec<u8> {
    let check = xai_core::crypto::sha256d(payload);
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&check.0[..4]);
    out.extend_from_slice(payload);
    out
}

/// Read every intact record; a torn or checksum-failing tail is reported,
/// not fatal.
fn read_records(path: &Path) -> Result<(Vec<Vec<u8>>, bool), XaiError> {
    let mut records = Vec::new();
    if !path.exists() {
        return Ok((records, true));
    }
    let data = fs::read(path).map_err(|e| storage_err(path, &e))?;
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + 8 > data.len() {
            return Ok((records, false));
        }
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        let check = &data[pos + 4..pos + 8];
        let start = pos + 8;
        if start + len > data.len() {
            return Ok((records, false));
        }
        let payload = &data[start..start + len];
        if xai_core::crypto::sha256d(payload).0[..4] != *check {
            return Ok((records, false));
        }
        records.push(payload.to_vec());
        pos = start + len;
    }
    Ok((records, true))
}

fn append_record(path: &Path, payload: &[u8], sync: bool) -> Result<(), XaiError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| storage_err(path, &e))?;
    file.write_all(&frame_record(payload)).map_err(|e| storage_err(path, &e))?;
    if sync {
        file.sync_all().map_err(|e| storage_err(path, &e))?;
    }
    Ok(())
}

/// Replace a record file's contents atomically (write temp, rename).
fn rewrite_records(path: &Path, payloads: &[Vec<u8>]) -> Result<(), XaiError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| storage_err(&tmp, &e))?;
        for payload in payloads {
            file.write_all(&frame_record(payload)).map_err(|e| storage_err(&tmp, &e))?;
        }
        file.sync_all().map_err(|e| storage_err(&tmp, &e))?;
    }
    fs::rename(&tmp, path).map_err(|e| storage_err(path, &e))?;
    Ok(())
}

fn storage_err(path: &Path, e: &dyn std::fmt::Display) -> XaiError {
    XaiError::Storage(format!("{}: {e}", path.display()))
}

/// File-backed [`ChainStore`].
pub struct FileStore {
    params: NetworkParams,
    dir: PathBuf,
    utxos: UtxoSet,
    nonces: HashMap<Address, u64>,
    hash_index: HashMap<Hash256, u64>,
    height_index: HashMap<u64, Hash256>,
    /// Active-chain headers, cached for difficulty and median-time walks.
    headers: HashMap<Hash256, BlockHeader>,
    /// Retained WAL window, oldest first.
    wal: Vec<WalRecord>,
    checkpoints: Vec<Checkpoint>,
    tip: Option<(u64, Hash256)>,
    /// Height the snapshot was taken at, if any.
    snapshot_height: Option<u64>,
}

impl FileStore {
    /// Open or create a store. Recovers from a torn commit by replaying the
    /// WAL tail; connects genesis on a fresh directory.
    pub fn open(dir: impl Into<PathBuf>, params: NetworkParams) -> Result<Self, XaiError> {
        let dir = dir.into();
        for sub in [BLOCKS_DIR, UTXO_DIR, CHECKPOINTS_DIR, ADDR_INDEX_DIR] {
            fs::create_dir_all(dir.join(sub)).map_err(|e| storage_err(&dir.join(sub), &e))?;
        }

        let mut store = Self {
            params,
            dir,
            utxos: UtxoSet::new(),
            nonces: HashMap::new(),
            hash_index: HashMap::new(),
            height_index: HashMap::new(),
            headers: HashMap::new(),
            wal: Vec::new(),
            checkpoints: Vec::new(),
            tip: None,
            snapshot_height: None,
        };

        store.load_snapshot()?;
        store.replay_deltas()?;
        store.load_hash_index()?;
        store.load_wal()?;
        store.load_checkpoints()?;
        store.recover_wal_tail()?;
        store.load_headers()?;
        store.verify_block_files()?;

        if store.tip.is_none() {
            info!("storage: fresh directory, connecting genesis");
            let genesis = genesis::genesis_block(&store.params);
            store.connect_block(&genesis)?;
        }
        if let Some((height, hash)) = store.tip {
            info!(height, %hash, "storage: opened");
        }
        Ok(store)
    }

    // --- paths ---

    fn block_path(&self, height: u64) -> PathBuf {
        self.dir.join(BLOCKS_DIR).join(format!("{height:06}.blk"))
    }

    fn hash_index_path(&self) -> PathBuf {
        self.dir.join(BLOCKS_DIR).join(HASH_INDEX_FILE)
    }

    fn wal_path(&self) -> PathBuf {
        self.dir.join(WAL_FILE)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(UTXO_DIR).join(SNAPSHOT_FILE)
    }

    fn delta_path(&self) -> PathBuf {
        self.dir.join(UTXO_DIR).join(DELTA_FILE)
    }

    fn checkpoint_path(&self, height: u64) -> PathBuf {
        self.dir.join(CHECKPOINTS_DIR).join(format!("{height:06}.cp"))
    }

    fn addr_bucket_path(&self, address: &Address) -> PathBuf {
        self.dir.join(ADDR_INDEX_DIR).join(format!("{:02x}.idx", address.hash160()[0]))
    }

    // --- startup loading ---

    fn load_snapshot(&mut self) -> Result<(), XaiError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(());
        }
        let data = fs::read(&path).map_err(|e| storage_err(&path, &e))?;
        let mut r = Reader::new(&data);
        let height = r.get_u64().map_err(XaiError::Codec)?;
        let expected_root = Hash256::decode_from(&mut r).map_err(XaiError::Codec)?;

        let count = r.get_varint().map_err(XaiError::Codec)?;
        let mut entries = Vec::with_capacity(count.min(1 << 20) as usize);
        for _ in 0..count {
            entries.push(<(OutPoint, UtxoEntry)>::decode_from(&mut r).map_err(XaiError::Codec)?);
        }
        self.utxos.produce(&entries).map_err(|e| XaiError::Storage(e.to_string()))?;
        self.nonces = decode_nonce_pairs(&mut r).map_err(XaiError::Codec)?.into_iter().collect();

        if self.utxos.utxo_root() != expected_root {
            return Err(XaiError::Storage(format!(
                "utxo snapshot at height {height} fails root verification"
            )));
        }
        let tip_hash = Hash256::decode_from(&mut r).map_err(XaiError::Codec)?;
        self.tip = Some((height, tip_hash));
        self.snapshot_height = Some(height);
        debug!(height, "storage: snapshot loaded");
        Ok(())
    }

    fn replay_deltas(&mut self) -> Result<(), XaiError> {
        let (records, clean) = read_records(&self.delta_path())?;
        if !clean {
            warn!("storage: delta log has a torn tail; dropping it");
        }
        for payload in records {
            let record = WalRecord::decode(&payload).map_err(XaiError::Codec)?;
            // Snapshot already covers records at or below its height.
            if let Some((tip_height, _)) = self.tip {
                if record.height <= tip_height {
                    continue;
                }
            }
            self.apply_record_to_memory(&record)?;
            self.tip = Some((record.height, record.deltas.block_hash));
        }
        Ok(())
    }

    fn apply_record_to_memory(&mut self, record: &WalRecord) -> Result<(), XaiError> {
        // Deltas re-apply as produced state: remove spent, add created.
        for (outpoint, _) in &record.deltas.spent {
            self.utxos
                .consume(&[*outpoint], u64::MAX, 0)
                .map_err(|e| XaiError::Storage(format!("delta replay: {e}")))?;
        }
        self.utxos
            .produce(&record.deltas.created)
            .map_err(|e| XaiError::Storage(e.to_string()))?;
        for (address, nonce) in &record.nonce_set {
            self.nonces.insert(*address, *nonce);
        }
        Ok(())
    }

    fn load_hash_index(&mut self) -> Result<(), XaiError> {
        let (records, clean) = read_records(&self.hash_index_path())?;
        if !clean {
            warn!("storage: hash index has a torn tail; dropping it");
        }
        for payload in records {
            let record = HashIndexRecord::decode(&payload).map_err(XaiError::Codec)?;
            if record.add {
                self.hash_index.insert(record.hash, record.height);
                self.height_index.insert(record.height, record.hash);
            } else {
                self.hash_index.remove(&record.hash);
                if self.height_index.get(&record.height) == Some(&record.hash) {
                    self.height_index.remove(&record.height);
                }
            }
        }
        Ok(())
    }

    fn load_wal(&mut self) -> Result<(), XaiError> {
        let (records, clean) = read_records(&self.wal_path())?;
        if !clean {
            warn!("storage: WAL has a torn tail record; treating it as uncommitted");
        }
        for payload in records {
            self.wal.push(WalRecord::decode(&payload).map_err(XaiError::Codec)?);
        }
        Ok(())
    }

    fn load_checkpoints(&mut self) -> Result<(), XaiError> {
        let dir = self.dir.join(CHECKPOINTS_DIR);
        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| storage_err(&dir, &e))? {
            let entry = entry.map_err(|e| storage_err(&dir, &e))?;
            let data = fs::read(entry.path()).map_err(|e| storage_err(&entry.path(), &e))?;
            checkpoints.push(Checkpoint::decode(&data).map_err(XaiError::Codec)?);
        }
        checkpoints.sort_by_key(|cp| cp.height);
        self.checkpoints = checkpoints;
        Ok(())
    }

    /// Revert WAL tail records whose block files never made it to disk.
    fn recover_wal_tail(&mut self) -> Result<(), XaiError> {
        let mut reverted_any = false;
        while let Some(last) = self.wal.last().cloned() {
            let committed = self
                .read_block_file(last.height)?
                .map(|block| block.hash() == last.deltas.block_hash)
                .unwrap_or(false);
            if committed {
                break;
            }
            warn!(height = last.height, "storage: reverting uncommitted WAL tail record");
            self.revert_record_in_memory(&last);
            self.tip = if last.height == 0 {
                None
            } else {
                // The previous record, or the block file below, names the parent.
                let parent_height = last.height - 1;
                let parent_hash = self
                    .read_block_file(parent_height)?
                    .map(|b| b.hash())
                    .ok_or_else(|| {
                        XaiError::Storage(format!(
                            "cannot recover: missing parent block at height {parent_height}"
                        ))
                    })?;
                Some((parent_height, parent_hash))
            };
            self.hash_index.remove(&last.deltas.block_hash);
            self.height_index.remove(&last.height);
            self.wal.pop();
            reverted_any = true;
        }
        self.persist_wal()?;

        // The delta log must not resurrect reverted records on the next open.
        if reverted_any {
            let tip_height = self.tip.map(|(h, _)| h);
            let (payloads, _) = read_records(&self.delta_path())?;
            let kept: Vec<Vec<u8>> = payloads
                .into_iter()
                .filter(|p| {
                    WalRecord::decode(p)
                        .map(|r| tip_height.is_some_and(|t| r.height <= t))
                        .unwrap_or(false)
                })
                .collect();
            rewrite_records(&self.delta_path(), &kept)?;
        }
        Ok(())
    }

    fn revert_record_in_memory(&mut self, record: &WalRecord) {
        self.utxos.revert_deltas(&record.deltas);
        for (address, prev) in &record.nonce_undo {
            if *prev == 0 {
                self.nonces.remove(address);
            } else {
                self.nonces.insert(*address, *prev);
            }
        }
    }

    fn load_headers(&mut self) -> Result<(), XaiError> {
        let Some((tip_height, _)) = self.tip else { return Ok(()) };
        for height in 0..=tip_height {
            if let Some(block) = self.read_block_file(height)? {
                self.headers.insert(block.hash(), block.header.clone());
            }
        }
        Ok(())
    }

    /// Verify block files against the WAL window; refuse to start on
    /// corruption the WAL cannot repair.
    fn verify_block_files(&self) -> Result<(), XaiError> {
        let Some((tip_height, tip_hash)) = self.tip else { return Ok(()) };

        // The tip must exist and hash correctly.
        let tip_block = self.read_block_file(tip_height)?.ok_or_else(|| {
            XaiError::Storage(format!("missing block file at tip height {tip_height}"))
        })?;
        if tip_block.hash() != tip_hash {
            return Err(XaiError::Storage(format!(
                "block file {tip_height} fails hash verification; delete it to force resync \
                 or run resync_from_checkpoint"
            )));
        }

        // Every WAL-window block must exist with the recorded hash.
        for record in &self.wal {
            let ok = self
                .read_block_file(record.height)?
                .map(|b| b.hash() == record.deltas.block_hash)
                .unwrap_or(false);
            if !ok {
                return Err(XaiError::Storage(format!(
                    "block file {} fails hash verification; delete it to force resync",
                    record.height
                )));
            }
        }
        Ok(())
    }

    fn read_block_file(&self, height: u64) -> Result<Option<Block>, XaiError> {
        let path = self.block_path(height);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).map_err(|e| storage_err(&path, &e))?;
        let block = Block::decode(&data)
            .map_err(|e| XaiError::Storage(format!("{}: {e}", path.display())))?;
        Ok(Some(block))
    }

    fn persist_wal(&self) -> Result<(), XaiError> {
        let payloads: Vec<Vec<u8>> = self.wal.iter().map(Encodable::encode).collect();
        rewrite_records(&self.wal_path(), &payloads)
    }

    /// Rewrite the snapshot at the current tip and truncate the delta log.
    fn write_snapshot(&mut self) -> Result<(), XaiError> {
        let Some((height, tip_hash)) = self.tip else { return Ok(()) };
        let mut w = Writer::new();
        w.put_u64(height);
        self.utxos.utxo_root().encode_into(&mut w);
        let mut entries: Vec<(OutPoint, UtxoEntry)> =
            self.utxos.iter().map(|(op, e)| (*op, e.clone())).collect();
        entries.sort_by_key(|(op, _)| *op);
        w.put_varint(entries.len() as u64);
        for entry in &entries {
            entry.encode_into(&mut w);
        }
        let mut nonce_pairs: Vec<(Address, u64)> =
            self.nonces.iter().map(|(a, n)| (*a, *n)).collect();
        nonce_pairs.sort();
        encode_nonce_pairs(&mut w, &nonce_pairs);
        tip_hash.encode_into(&mut w);

        let tmp = self.snapshot_path().with_extension("tmp");
        fs::write(&tmp, w.into_bytes()).map_err(|e| storage_err(&tmp, &e))?;
        fs::rename(&tmp, self.snapshot_path())
            .map_err(|e| storage_err(&self.snapshot_path(), &e))?;
        rewrite_records(&self.delta_path(), &[])?;
        self.snapshot_height = Some(height);
        debug!(height, "storage: snapshot written");
        Ok(())
    }

    fn append_addr_records(&self, block: &Block, add: bool) -> Result<(), XaiError> {
        let height = block.header.height;
        for tx in &block.transactions {
            let txid = tx.txid();
            if !tx.is_coinbase() {
                let record = AddrIndexRecord {
                    add,
                    address: tx.sender,
                    entry: AddressHistoryEntry { txid, height, direction: Direction::Sent },
                };
                append_record(&self.addr_bucket_path(&tx.sender), &record.encode(), false)?;
            }
            for out in &tx.outputs {
                let record = AddrIndexRecord {
                    add,
                    address: out.address,
                    entry: AddressHistoryEntry { txid, height, direction: Direction::Received },
                };
                append_record(&self.addr_bucket_path(&out.address), &record.encode(), false)?;
            }
        }
        Ok(())
    }

    /// Rebuild every index and the UTXO set from the block files alone.
    pub fn reindex(&mut self) -> Result<(), XaiError> {
        info!("storage: reindexing from block files");
        self.utxos = UtxoSet::new();
        self.nonces.clear();
        self.hash_index.clear();
        self.height_index.clear();
        self.headers.clear();
        self.wal.clear();
        self.checkpoints.clear();
        self.tip = None;
        self.snapshot_height = None;

        // Clear derived files.
        rewrite_records(&self.hash_index_path(), &[])?;
        rewrite_records(&self.delta_path(), &[])?;
        rewrite_records(&self.wal_path(), &[])?;
        let _ = fs::remove_file(self.snapshot_path());
        let cp_dir = self.dir.join(CHECKPOINTS_DIR);
        for entry in fs::read_dir(&cp_dir).map_err(|e| storage_err(&cp_dir, &e))? {
            let entry = entry.map_err(|e| storage_err(&cp_dir, &e))?;
            let _ = fs::remove_file(entry.path());
        }
        let ai_dir = self.dir.join(ADDR_INDEX_DIR);
        for entry in fs::read_dir(&ai_dir).map_err(|e| storage_err(&ai_dir, &e))? {
            let entry = entry.map_err(|e| storage_err(&ai_dir, &e))?;
            let _ = fs::remove_file(entry.path());
        }

        let mut height = 0u64;
        while let Some(block) = self.read_block_file(height)? {
            self.connect_block(&block)?;
            height += 1;
        }
        info!(blocks = height, "storage: reindex complete");
        Ok(())
    }

    /// Truncate the chain back to the newest checkpoint whose state
    /// verifies, dropping all block files above it.
    pub fn resync_from_checkpoint(&mut self) -> Result<u64, XaiError> {
        let Some(cp) = self.checkpoints.last().copied() else {
            return Err(XaiError::Storage("no checkpoint to resync from".into()));
        };
        info!(height = cp.height, "storage: resyncing from checkpoint");

        // Remove block files above the checkpoint, then rebuild everything.
        let Some((tip_height, _)) = self.tip else {
            return Err(XaiError::Storage("empty chain".into()));
        };
        for height in (cp.height + 1)..=tip_height {
            let _ = fs::remove_file(self.block_path(height));
        }
        self.reindex()?;

        let verified = self.tip == Some((cp.height, cp.block_hash))
            && self.utxos.utxo_root() == cp.utxo_root;
        if !verified {
            return Err(XaiError::Storage(format!(
                "checkpoint at height {} fails verification after resync",
                cp.height
            )));
        }
        Ok(cp.height)
    }

    /// Blocks currently on disk (tip height + 1, or 0 when empty).
    pub fn block_count(&self) -> u64 {
        self.tip.map(|(h, _)| h + 1).unwrap_or(0)
    }
}

impl ChainStore for FileStore {
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
                    return Err(
                        ChainError::Block(xai_core::error::BlockError::PrevHashMismatch).into()
                    );
                }
            }
        }

        let block_hash = block.hash();
        if self.hash_index.contains_key(&block_hash) {
            return Err(ChainError::DuplicateBlock(block_hash.to_string()).into());
        }

        // Apply to the UTXO set first; failure leaves no trace.
        let deltas = self
            .utxos
            .apply_block(block, self.params.coinbase_maturity)
            .map_err(ChainError::from)?;

        // Nonce index updates.
        let mut nonce_set: Vec<(Address, u64)> = Vec::new();
        let mut nonce_undo: Vec<(Address, u64)> = Vec::new();
        for tx in &block.transactions {
            if tx.is_coinbase() {
                continue;
            }
            let prev = self.nonces.get(&tx.sender).copied().unwrap_or(0);
            let next = tx.nonce + 1;
            if nonce_undo.iter().all(|(a, _)| *a != tx.sender) {
                nonce_undo.push((tx.sender, prev));
            }
            if next > prev {
                self.nonces.insert(tx.sender, next);
                match nonce_set.iter_mut().find(|(a, _)| *a == tx.sender) {
                    Some(pair) => pair.1 = next,
                    None => nonce_set.push((tx.sender, next)),
                }
            }
        }

        let record = WalRecord { height, deltas: deltas.clone(), nonce_set, nonce_undo };
        let payload = record.encode();

        // WAL first, fsynced: the block is committed once this hits disk.
        append_record(&self.wal_path(), &payload, true)?;
        append_record(&self.delta_path(), &payload, false)?;

        // Block file, then indexes.
        fs::write(self.block_path(height), block.encode())
            .map_err(|e| storage_err(&self.block_path(height), &e))?;
        append_record(
            &self.hash_index_path(),
            &HashIndexRecord { add: true, hash: block_hash, height }.encode(),
            false,
        )?;
        self.append_addr_records(block, true)?;

        self.hash_index.insert(block_hash, height);
        self.height_index.insert(height, block_hash);
        self.headers.insert(block_hash, block.header.clone());
        self.wal.push(record);
        self.tip = Some((height, block_hash));

        // Prune the WAL window.
        let retention = self.params.wal_retention() as usize;
        if self.wal.len() > retention {
            let drop = self.wal.len() - retention;
            self.wal.drain(..drop);
            self.persist_wal()?;
        }

        // Periodic checkpoint: pin (height, hash, utxo root) and roll the
        // snapshot forward.
        if self.params.checkpoint_interval > 0
            && height > 0
            && height % self.params.checkpoint_interval == 0
        {
            let cp = Checkpoint { height, block_hash, utxo_root: self.utxos.utxo_root() };
            fs::write(self.checkpoint_path(height), cp.encode())
                .map_err(|e| storage_err(&self.checkpoint_path(height), &e))?;
            self.checkpoints.push(cp);
            self.write_snapshot()?;
        }

        debug!(height, %block_hash, "storage: block appended");
        Ok(deltas)
    }

    fn disconnect_tip(&mut self) -> Result<Block, XaiError> {
        let (tip_height, tip_hash) = self.tip.ok_or(ChainError::EmptyChain)?;

        let record = match self.wal.last() {
            Some(r) if r.deltas.block_hash == tip_hash => r.clone(),
            _ => return Err(ChainError::UndoDataMissing(tip_hash.to_string()).into()),
        };
        let block = self
            .read_block_file(tip_height)?
            .ok_or_else(|| ChainError::BlockNotFound(tip_hash.to_string()))?;

        self.revert_record_in_memory(&record);
        self.wal.pop();
        self.persist_wal()?;

        // Remove the block file and index rows.
        fs::remove_file(self.block_path(tip_height))
            .map_err(|e| storage_err(&self.block_path(tip_height), &e))?;
        append_record(
            &self.hash_index_path(),
            &HashIndexRecord { add: false, hash: tip_hash, height: tip_height }.encode(),
            false,
        )?;
        self.append_addr_records(&block, false)?;

        // Rewrite the delta log without this block's record.
        let (payloads, _) = read_records(&self.delta_path())?;
        let kept: Vec<Vec<u8>> = payloads
            .into_iter()
            .filter(|p| WalRecord::decode(p).map(|r| r.height != tip_height).unwrap_or(false))
            .collect();
        rewrite_records(&self.delta_path(), &kept)?;

        // Drop any checkpoint at the reverted height.
        let removed_heights: Vec<u64> = self
            .checkpoints
            .iter()
            .filter(|cp| cp.height >= tip_height)
            .map(|cp| cp.height)
            .collect();
        for height in removed_heights {
            let _ = fs::remove_file(self.checkpoint_path(height));
        }
        self.checkpoints.retain(|cp| cp.height < tip_height);

        self.hash_index.remove(&tip_hash);
        self.height_index.remove(&tip_height);
        self.headers.remove(&tip_hash);
        self.tip = if tip_height == 0 {
            None
        } else {
            Some((tip_height - 1, block.header.prev_hash))
        };

        // A snapshot at or above the reverted height would resurrect it on
        // the next open; roll the snapshot back to the new tip.
        if self.snapshot_height.is_some_and(|h| h >= tip_height) {
            if self.tip.is_some() {
                self.write_snapshot()?;
            } else {
                let _ = fs::remove_file(self.snapshot_path());
                self.snapshot_height = None;
            }
        }

        debug!(height = tip_height, "storage: block reverted");
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
        match self.hash_index.get(hash) {
            Some(height) => self.read_block_file(*height),
            None => Ok(None),
        }
    }

    fn get_block_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, XaiError> {
        Ok(self.headers.get(hash).cloned())
    }

    fn get_block_hash(&self, height: u64) -> Result<Option<Hash256>, XaiError> {
        Ok(self.height_index.get(&height).copied())
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
        let (records, _) = read_records(&self.addr_bucket_path(address))?;
        let mut rows: Vec<AddressHistoryEntry> = Vec::new();
        for payload in records {
            let record = AddrIndexRecord::decode(&payload).map_err(XaiError::Codec)?;
            if record.address != *address {
                continue;
            }
            if record.add {
                rows.push(record.entry);
            } else {
                rows.retain(|r| !(r.txid == record.entry.txid && r.height == record.entry.height));
            }
        }
        Ok(rows.into_iter().rev().skip(offset).take(limit).collect())
    }

    fn latest_checkpoint(&self) -> Result<Option<Checkpoint>, XaiError> {
        Ok(self.checkpoints.last().copied())
    }
}
