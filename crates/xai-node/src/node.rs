//! Full-node composition and event loop.
//!
//! The [`Node`] wires the file store, mempool, chain manager, miner, sync
//! engine, and network service together. Data flows one way: network events
//! and miner solutions come in, pass through validation and the chain
//! manager, and the results fan back out as mempool updates, miner template
//! refreshes, and gossip. The chain manager is the only writer of chain
//! state; everything here reads snapshots or goes through it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use xai_consensus::chain::{BlockOutcome, ChainEvent, ChainManager, SyncState};
use xai_consensus::miner::{self, Miner};
use xai_core::address::Address;
use xai_core::error::XaiError;
use xai_core::mempool::Mempool;
use xai_core::params::NetworkParams;
use xai_core::reward;
use xai_core::store::{AddressHistoryEntry, ChainStore};
use xai_core::types::{Block, Hash256, OutPoint, Transaction, UtxoEntry};
use xai_core::validation::{self, StoreView};
use xai_core::crypto::KeyPair;
use xai_core::difficulty::ChainWork;
use xai_network::protocol::{InvItem, InvKind, MAX_HEADERS_PER_MSG, Message};
use xai_network::service::TipInfo;
use xai_network::sync::{SyncAction, SyncEngine, SyncPhase};
use xai_network::{NetworkCommand, NetworkEvent, NetworkService, PeerId};

use crate::config::NodeConfig;
use crate::storage::FileStore;

/// How often the maintenance tick fires (mempool TTL, unbans, timeouts).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Runtime counters. Relaxed ordering: these feed status output, nothing
/// consensus-critical.
#[derive(Default)]
pub struct NodeMetrics {
    pub blocks_connected: AtomicU64,
    pub reorgs: AtomicU64,
    pub txs_accepted: AtomicU64,
}

/// Snapshot of node state for the `status` command.
#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub network: String,
    pub height: u64,
    pub tip_hash: Hash256,
    pub peer_count: usize,
    pub mempool_size: usize,
    pub mempool_bytes: usize,
    pub utxo_count: usize,
    pub total_supply: u64,
    pub sync_phase: String,
    pub orphans: usize,
    pub blocks_connected: u64,
    pub reorgs: u64,
}

/// The full node.
pub struct Node {
    config: NodeConfig,
    params: NetworkParams,
    storage: Arc<RwLock<FileStore>>,
    chain: Mutex<ChainManager<FileStore>>,
    /// Commit/revert bus from the chain manager; drained after every block
    /// submission so mempool and miner state follow the tip. Covers commits
    /// the manager performs internally (orphan chains, reorg restores) that
    /// never surface as a direct outcome.
    chain_events: Mutex<broadcast::Receiver<ChainEvent>>,
    mempool: Mutex<Mempool>,
    sync: Mutex<SyncEngine>,
    miner: Mutex<Option<Miner>>,
    found_rx: Mutex<Option<mpsc::UnboundedReceiver<Block>>>,
    network: Option<NetworkService>,
    events_rx: Mutex<Option<broadcast::Receiver<NetworkEvent>>>,
    shutdown: tokio::sync::Notify,
    metrics: NodeMetrics,
}

impl Node {
    /// Open storage and start the network service.
    pub async fn new(config: NodeConfig) -> Result<Arc<Self>, XaiError> {
        config.validate()?;
        let params = config.params();

        let (network, events_rx) = if config.no_network {
            (None, None)
        } else {
            let keypair = load_or_create_node_key(&config)?;
            let (service, events) =
                NetworkService::start(config.p2p.clone(), params.clone(), keypair).await?;
            (Some(service), Some(events))
        };

        let node = Self::assemble(config, params, network, events_rx)?;

        // Advertise our tip; the service already dialed operator-supplied
        // peers, so only fall back to the network's well-known seeds.
        if let Some(net) = &node.network {
            net.set_tip(node.tip_info());
            if node.config.p2p.bootstrap_peers.is_empty() {
                for addr in &node.params.bootstrap_peers {
                    let _ = net.commands().try_send(NetworkCommand::Dial(addr.clone()));
                }
            }
        }
        node.start_miner();
        Ok(node)
    }

    /// A node with no networking; used by tests and single-node tools.
    pub fn without_network(config: NodeConfig) -> Result<Arc<Self>, XaiError> {
        config.validate()?;
        let params = config.params();
        let node = Self::assemble(config, params, None, None)?;
        node.start_miner();
        Ok(node)
    }

    fn assemble(
        config: NodeConfig,
        params: NetworkParams,
        network: Option<NetworkService>,
        events_rx: Option<broadcast::Receiver<NetworkEvent>>,
    ) -> Result<Arc<Self>, XaiError> {
        let store = FileStore::open(config.chain_dir(), params.clone())?;
        let storage = Arc::new(RwLock::new(store));
        let chain = ChainManager::new(Arc::clone(&storage), params.clone())?;
        let chain_events = chain.subscribe();
        let mempool = Mempool::new(params.clone());
        let mut sync = SyncEngine::new(params.clone());

        if let Some((height, hash)) = storage.read().tip()? {
            let work = chain.tip_work()?;
            sync.set_local_tip(height, hash, work);
        }

        Ok(Arc::new(Self {
            config,
            params,
            storage,
            chain: Mutex::new(chain),
            chain_events: Mutex::new(chain_events),
            mempool: Mutex::new(mempool),
            sync: Mutex::new(sync),
            miner: Mutex::new(None),
            found_rx: Mutex::new(None),
            network,
            events_rx: Mutex::new(events_rx),
            shutdown: tokio::sync::Notify::new(),
            metrics: NodeMetrics::default(),
        }))
    }

    fn now_unix() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
    }

    fn tip_info(&self) -> TipInfo {
        let (height, hash) = {
            let store = self.storage.read();
            store.tip().ok().flatten().unwrap_or((0, Hash256::ZERO))
        };
        let work = self.chain.lock().tip_work().unwrap_or(ChainWork::ZERO);
        TipInfo { hash, height, work }
    }

    // ------------------------------------------------------------------
    // CLI surface
    // ------------------------------------------------------------------

    /// Validate and admit a transaction, then announce it.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, XaiError> {
        validation::validate_transaction_stateless(&tx, &self.params)?;
        let txid = {
            let store = self.storage.read();
            let tip_height = store.tip()?.map(|(h, _)| h).unwrap_or(0);
            self.mempool.lock().insert(tx, &StoreView(&*store), tip_height)?
        };
        self.metrics.txs_accepted.fetch_add(1, Ordering::Relaxed);
        self.broadcast(Message::InvTx(vec![txid]), None);
        debug!(%txid, "node: transaction accepted");
        Ok(txid)
    }

    /// Feed a block into the chain (miner, peer, or operator submission).
    pub fn submit_block(&self, block: Block, from_peer: Option<PeerId>) -> Result<BlockOutcome, XaiError> {
        let block_hash = block.hash();
        let result = self.chain.lock().process_block(block);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                // A failed reorg still emitted revert/restore events.
                self.drain_chain_events();
                if let Some(peer) = from_peer {
                    self.punish_peer(&peer, &e);
                }
                return Err(e);
            }
        };
        self.drain_chain_events();

        match &outcome {
            BlockOutcome::Committed | BlockOutcome::Reorganized { .. } => {
                self.broadcast(Message::InvBlock(vec![block_hash]), from_peer);
            }
            BlockOutcome::Orphaned { missing_parent } => {
                if let Some(peer) = from_peer {
                    // Fetch the immediate parent and walk the gap behind it.
                    self.send_to(peer, Message::GetBlock(*missing_parent));
                    let (_, tip_hash) = {
                        let store = self.storage.read();
                        store.tip().ok().flatten().unwrap_or((0, Hash256::ZERO))
                    };
                    self.send_to(
                        peer,
                        Message::GetHeaders {
                            from_hash: tip_hash,
                            count: xai_core::constants::MAX_HEADER_WALK
                                .min(MAX_HEADERS_PER_MSG as u64)
                                as u32,
                        },
                    );
                }
            }
            BlockOutcome::AlreadyKnown | BlockOutcome::SideBranch => {}
        }
        Ok(outcome)
    }

    /// Apply all pending commit/revert events to the mempool, metrics, sync
    /// engine, and miner. The bus is the single source of truth for chain
    /// mutations, including those the manager performed internally.
    fn drain_chain_events(&self) {
        let mut reverted_blocks: Vec<Arc<Block>> = Vec::new();
        let mut tip_changed = false;

        loop {
            let event = self.chain_events.lock().try_recv();
            match event {
                Ok(ChainEvent::Committed(block)) => {
                    tip_changed = true;
                    self.metrics.blocks_connected.fetch_add(1, Ordering::Relaxed);
                    let store = self.storage.read();
                    self.mempool.lock().remove_confirmed_block(&block, &StoreView(&*store));
                }
                Ok(ChainEvent::Reverted(block)) => {
                    tip_changed = true;
                    reverted_blocks.push(block);
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "node: chain event stream lagged");
                }
                Err(_) => break,
            }
        }

        if !reverted_blocks.is_empty() {
            self.metrics.reorgs.fetch_add(1, Ordering::Relaxed);
            // Re-admit old-branch transactions against the final state,
            // oldest block first so per-sender nonce chains stay intact.
            // Anything confirmed or conflicted on the new branch fails
            // stateful validation and is dropped.
            let store = self.storage.read();
            let view = StoreView(&*store);
            let tip_height = store.tip().ok().flatten().map(|(h, _)| h).unwrap_or(0);
            let mut mempool = self.mempool.lock();
            reverted_blocks.sort_by_key(|b| b.header.height);
            for block in &reverted_blocks {
                for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                    match mempool.insert(tx.clone(), &view, tip_height) {
                        Ok(txid) => debug!(%txid, "node: reverted tx re-admitted"),
                        Err(e) => debug!(error = %e, "node: reverted tx dropped"),
                    }
                }
            }
        }

        if tip_changed {
            self.sync_tip_changed();
        }
    }

    /// Current node status snapshot. Locks are taken one at a time.
    pub fn status(&self) -> NodeStatus {
        let (height, tip_hash, utxo_count, total_supply) = {
            let store = self.storage.read();
            let (height, tip_hash) = store.tip().ok().flatten().unwrap_or((0, Hash256::ZERO));
            (height, tip_hash, store.utxo_count(), store.total_utxo_amount())
        };
        let (mempool_size, mempool_bytes) = {
            let mempool = self.mempool.lock();
            (mempool.len(), mempool.total_bytes())
        };
        let sync_phase = format!("{:?}", self.sync.lock().phase());
        let orphans = self.chain.lock().orphan_count();
        NodeStatus {
            network: self.params.network.to_string(),
            height,
            tip_hash,
            peer_count: self.network.as_ref().map(NetworkService::peer_count).unwrap_or(0),
            mempool_size,
            mempool_bytes,
            utxo_count,
            total_supply,
            sync_phase,
            orphans,
            blocks_connected: self.metrics.blocks_connected.load(Ordering::Relaxed),
            reorgs: self.metrics.reorgs.load(Ordering::Relaxed),
        }
    }

    pub fn get_block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, XaiError> {
        self.storage.read().get_block(hash)
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, XaiError> {
        self.storage.read().get_block_by_height(height)
    }

    /// Find a transaction in the mempool or on the active chain.
    ///
    /// Returns the transaction and its confirmation height (`None` while
    /// pending). Chain lookup walks block files newest-first.
    pub fn get_transaction(
        &self,
        txid: &Hash256,
    ) -> Result<Option<(Transaction, Option<u64>)>, XaiError> {
        if let Some(entry) = self.mempool.lock().get(txid) {
            return Ok(Some((entry.tx.clone(), None)));
        }
        let store = self.storage.read();
        let Some((tip_height, _)) = store.tip()? else { return Ok(None) };
        for height in (0..=tip_height).rev() {
            if let Some(block) = store.get_block_by_height(height)? {
                if let Some(tx) = block.transactions.iter().find(|tx| tx.txid() == *txid) {
                    return Ok(Some((tx.clone(), Some(height))));
                }
            }
        }
        Ok(None)
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, XaiError> {
        self.storage.read().get_utxo(outpoint)
    }

    pub fn get_address_history(
        &self,
        address: &Address,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AddressHistoryEntry>, XaiError> {
        self.storage.read().get_address_history(address, limit, offset)
    }

    /// Build a mining template on the current tip for an external miner.
    pub fn build_template(&self, miner_address: Address) -> Result<Block, XaiError> {
        let store = self.storage.read();
        let mempool = self.mempool.lock();
        miner::build_block_template(&*store, &mempool, &self.params, miner_address, Self::now_unix())
    }

    /// Rebuild all indexes and the UTXO set from block files.
    pub fn reindex(&self) -> Result<(), XaiError> {
        self.storage.write().reindex()
    }

    /// Truncate the chain to the newest verifying checkpoint.
    pub fn resync_from_checkpoint(&self) -> Result<u64, XaiError> {
        let height = self.storage.write().resync_from_checkpoint()?;
        // The in-memory chain index is stale after the truncation; the event
        // bus moves with the rebuilt manager.
        let rebuilt = ChainManager::new(Arc::clone(&self.storage), self.params.clone())?;
        *self.chain_events.lock() = rebuilt.subscribe();
        *self.chain.lock() = rebuilt;
        Ok(height)
    }

    /// Signal the event loop to stop.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// Stop mining workers (graceful shutdown path).
    pub fn stop_miner(&self) {
        if let Some(miner) = self.miner.lock().take() {
            miner.shutdown();
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn start_miner(&self) {
        if self.config.miner_address.is_none() {
            return;
        }
        let (found_tx, found_rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(self.config.miner_threads, found_tx);
        *self.miner.lock() = Some(miner);
        *self.found_rx.lock() = Some(found_rx);
        self.refresh_miner_template();
    }

    /// Rebuild and publish a mining template on the current tip.
    fn refresh_miner_template(&self) {
        let Some(miner_address) = self.config.miner_address else { return };
        let guard = self.miner.lock();
        let Some(miner) = guard.as_ref() else { return };

        // Do not burn cycles on stale templates while far behind peers.
        let phase = self.sync.lock().phase();
        if self.network.is_some()
            && !matches!(phase, SyncPhase::Synced | SyncPhase::Idle | SyncPhase::DiscoveringTips)
        {
            miner.clear_template();
            return;
        }

        let store = self.storage.read();
        let mempool = self.mempool.lock();
        match miner::build_block_template(
            &*store,
            &mempool,
            &self.params,
            miner_address,
            Self::now_unix(),
        ) {
            Ok(template) => miner.set_template(template),
            Err(e) => warn!(error = %e, "node: failed to build mining template"),
        }
    }

    fn sync_tip_changed(&self) {
        let (height, hash) = {
            let store = self.storage.read();
            store.tip().ok().flatten().unwrap_or((0, Hash256::ZERO))
        };
        let work = self.chain.lock().tip_work().unwrap_or(ChainWork::ZERO);
        self.sync.lock().set_local_tip(height, hash, work);
        if let Some(net) = &self.network {
            net.set_tip(TipInfo { hash, height, work });
        }
        self.refresh_miner_template();
    }

    fn punish_peer(&self, peer: &PeerId, error: &XaiError) {
        let Some(net) = &self.network else { return };
        let kind = error.kind();
        let banned = net.registry().debit(peer, kind, Self::now_unix());
        debug!(%peer, ?kind, banned, "node: peer penalized");
    }

    fn send_to(&self, peer: PeerId, message: Message) {
        if let Some(net) = &self.network {
            let _ = net.commands().try_send(NetworkCommand::SendTo(peer, message));
        }
    }

    fn broadcast(&self, message: Message, exclude: Option<PeerId>) {
        if let Some(net) = &self.network {
            let _ = net.commands().try_send(NetworkCommand::Broadcast { message, exclude });
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Run the node until [`Node::stop`] is called.
    pub async fn run(self: Arc<Self>) {
        let mut events_rx = self.events_rx.lock().take();
        let mut found_rx = self.found_rx.lock().take();
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("node: shutting down");
                    break;
                }
                event = recv_event(&mut events_rx) => {
                    match event {
                        Some(event) => self.handle_network_event(event),
                        None => tokio::time::sleep(Duration::from_millis(50)).await,
                    }
                }
                block = recv_found(&mut found_rx) => {
                    if let Some(block) = block {
                        let height = block.header.height;
                        match self.submit_block(block, None) {
                            Ok(BlockOutcome::Committed) => {
                                info!(height, "node: mined block committed");
                            }
                            Ok(_) => {}
                            Err(e) => debug!(error = %e, "node: mined block rejected (stale tip)"),
                        }
                    }
                }
                _ = maintenance.tick() => {
                    self.maintenance_tick();
                }
            }
        }
        self.stop_miner();
    }

    fn maintenance_tick(&self) {
        self.drain_chain_events();
        let expired = self.mempool.lock().evict_expired();
        if expired > 0 {
            debug!(expired, "node: mempool TTL eviction");
        }
        if let Some(net) = &self.network {
            net.registry().unban_expired(Self::now_unix());
        }
        let actions = self.sync.lock().check_timeouts(Instant::now());
        self.execute_sync_actions(actions);
    }

    fn handle_network_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected { peer, endpoint } => {
                info!(%peer, %endpoint, "node: peer connected");
                let actions = self.sync.lock().on_peer_connected(peer);
                self.execute_sync_actions(actions);
            }
            NetworkEvent::PeerDisconnected { peer } => {
                info!(%peer, "node: peer disconnected");
                let actions = self.sync.lock().on_peer_disconnected(peer);
                self.execute_sync_actions(actions);
            }
            NetworkEvent::MessageReceived { peer, message } => {
                self.handle_message(peer, message);
            }
        }
    }

    fn handle_message(&self, peer: PeerId, message: Message) {
        match message {
            Message::Hello { best_tip_hash, best_tip_height, cumulative_work, .. } => {
                let actions = self.sync.lock().on_peer_tip(
                    peer,
                    best_tip_height,
                    best_tip_hash,
                    cumulative_work,
                    Instant::now(),
                );
                self.execute_sync_actions(actions);
            }
            Message::Ping(nonce) => self.send_to(peer, Message::Pong(nonce)),
            Message::Pong(_) => {}
            Message::GetHeaders { from_hash, count } => {
                self.serve_headers(peer, from_hash, count);
            }
            Message::Headers(headers) => {
                let actions = self.sync.lock().on_headers(peer, headers, Instant::now());
                self.execute_sync_actions(actions);
            }
            Message::GetBlock(hash) => {
                if let Ok(Some(block)) = self.get_block_by_hash(&hash) {
                    self.send_to(peer, Message::BlockMsg(block));
                }
            }
            Message::BlockMsg(block) => self.handle_peer_block(peer, block),
            Message::InvTx(ids) => {
                let wanted: Vec<InvItem> = {
                    let mempool = self.mempool.lock();
                    ids.into_iter()
                        .filter(|id| !mempool.contains(id))
                        .map(|id| InvItem { kind: InvKind::Tx, id })
                        .collect()
                };
                if !wanted.is_empty() {
                    self.send_to(peer, Message::GetData(wanted));
                }
            }
            Message::InvBlock(ids) => {
                let wanted: Vec<InvItem> = {
                    let store = self.storage.read();
                    ids.into_iter()
                        .filter(|id| !store.contains_block(id).unwrap_or(false))
                        .map(|id| InvItem { kind: InvKind::Block, id })
                        .collect()
                };
                if !wanted.is_empty() {
                    self.send_to(peer, Message::GetData(wanted));
                }
            }
            Message::GetData(items) => self.serve_data(peer, items),
            Message::Tx(tx) => {
                if let Err(e) = self.submit_transaction(tx) {
                    self.punish_peer(&peer, &e);
                }
            }
            Message::Reject { id, kind, reason } => {
                debug!(%peer, %id, ?kind, reason, "node: peer rejected our object");
            }
        }
    }

    fn handle_peer_block(&self, peer: PeerId, block: Block) {
        let syncing = matches!(self.sync.lock().phase(), SyncPhase::DownloadingBlocks);
        if syncing {
            let actions = self.sync.lock().on_block(peer, block, Instant::now());
            self.execute_sync_actions(actions);
        } else if let Err(e) = self.submit_block(block, Some(peer)) {
            debug!(%peer, error = %e, "node: peer block rejected");
        }
    }

    fn serve_headers(&self, peer: PeerId, from_hash: Hash256, count: u32) {
        let store = self.storage.read();
        let Ok(Some(start_header)) = store.get_block_header(&from_hash) else {
            self.send_to(
                peer,
                Message::Reject {
                    id: from_hash,
                    kind: xai_network::protocol::RejectKind::Validation,
                    reason: "unknown locator".into(),
                },
            );
            return;
        };

        let count = count.min(MAX_HEADERS_PER_MSG as u32) as u64;
        let mut headers = Vec::new();
        for height in (start_header.height + 1)..=(start_header.height + count) {
            let Ok(Some(hash)) = store.get_block_hash(height) else { break };
            let Ok(Some(header)) = store.get_block_header(&hash) else { break };
            headers.push(header);
        }
        drop(store);
        self.send_to(peer, Message::Headers(headers));
    }

    fn serve_data(&self, peer: PeerId, items: Vec<InvItem>) {
        for item in items {
            match item.kind {
                InvKind::Tx => {
                    let tx = self.mempool.lock().get(&item.id).map(|e| e.tx.clone());
                    if let Some(tx) = tx {
                        self.send_to(peer, Message::Tx(tx));
                    }
                }
                InvKind::Block => {
                    if let Ok(Some(block)) = self.get_block_by_hash(&item.id) {
                        self.send_to(peer, Message::BlockMsg(block));
                    }
                }
            }
        }
    }

    fn execute_sync_actions(&self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::RequestTip(peer) => {
                    // Our hello invites theirs; tips were also exchanged at
                    // connect time.
                    let tip = self.tip_info();
                    self.send_to(
                        peer,
                        Message::Hello {
                            version: 1,
                            network_id: self.params.network.id(),
                            best_tip_hash: tip.hash,
                            best_tip_height: tip.height,
                            cumulative_work: tip.work,
                        },
                    );
                }
                SyncAction::RequestHeaders { peer, from_hash, count } => {
                    self.send_to(peer, Message::GetHeaders { from_hash, count });
                }
                SyncAction::RequestBlock { peer, hash } => {
                    self.send_to(peer, Message::GetBlock(hash));
                }
                SyncAction::ConnectBlock(block) => {
                    if let Err(e) = self.submit_block(block, None) {
                        warn!(error = %e, "node: sync block failed, restarting sync");
                        self.sync.lock().cancel_downloads();
                    }
                }
                SyncAction::DiscardPeer(peer) => {
                    if let Some(net) = &self.network {
                        net.registry().debit(
                            &peer,
                            xai_core::error::ErrorKind::Consensus,
                            Self::now_unix(),
                        );
                        let _ = net.commands().try_send(NetworkCommand::Disconnect(peer));
                    }
                }
                SyncAction::Complete => {
                    info!("node: sync complete, entering active state");
                    self.chain.lock().set_state(SyncState::Active);
                    self.refresh_miner_template();
                }
            }
        }
    }

    /// The minted supply the chain should carry at the current height.
    pub fn expected_supply(&self) -> Result<u64, XaiError> {
        let store = self.storage.read();
        let height = store.tip()?.map(|(h, _)| h).unwrap_or(0);
        Ok(reward::cumulative_supply_before(&self.params, height + 1))
    }
}

async fn recv_event(
    rx: &mut Option<broadcast::Receiver<NetworkEvent>>,
) -> Option<NetworkEvent> {
    match rx {
        Some(rx) => rx.recv().await.ok(),
        None => {
            // No network: park this select arm.
            std::future::pending::<()>().await;
            None
        }
    }
}

async fn recv_found(rx: &mut Option<mpsc::UnboundedReceiver<Block>>) -> Option<Block> {
    match rx {
        Some(rx) => rx.recv().await,
        None => {
            std::future::pending::<()>().await;
            None
        }
    }
}

/// Load the node's P2P identity key, creating one on first start.
fn load_or_create_node_key(config: &NodeConfig) -> Result<KeyPair, XaiError> {
    let path = config.node_key_path();
    if path.exists() {
        let data = zeroize::Zeroizing::new(
            std::fs::read(&path).map_err(|e| XaiError::Storage(format!("{}: {e}", path.display())))?,
        );
        let bytes: [u8; 32] = data
            .as_slice()
            .try_into()
            .map_err(|_| XaiError::Storage("node.key is not 32 bytes".into()))?;
        return KeyPair::from_secret_bytes(&bytes)
            .map_err(|_| XaiError::Storage("node.key is not a valid secret key".into()));
    }

    std::fs::create_dir_all(config.data_dir.clone())
        .map_err(|e| XaiError::Storage(e.to_string()))?;
    let keypair = KeyPair::generate();
    std::fs::write(&path, keypair.secret_bytes().as_slice())
        .map_err(|e| XaiError::Storage(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), "node: generated new identity key");
    Ok(keypair)
}
