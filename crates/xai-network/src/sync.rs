//! Chain synchronization engine: headers-first download with parallel block
//! fetch.
//!
//! The engine is a pure state machine. The node feeds it peer events
//! (`on_peer_*`, `on_headers`, `on_block`) and executes the [`SyncAction`]s
//! it returns; it never touches sockets or chain state itself.
//!
//! Protocol: discover tips from connected peers, follow the peer claiming
//! the most cumulative work, pull headers in `header_batch` batches
//! (validating linkage, proof-of-work, and checkpoint pins as they arrive —
//! peers serving bad headers are discarded), then download bodies in
//! parallel with per-peer in-flight caps and timeout reassignment. Bodies
//! are released for connection strictly in chain order. The engine reports
//! `Synced` once the local tip is within `gap_tolerance` of the best
//! observed peer tip.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use xai_consensus::checkpoint;
use xai_core::difficulty::{self, ChainWork};
use xai_core::params::NetworkParams;
use xai_core::types::{Block, BlockHeader, Hash256};

use crate::peers::PeerId;

/// Most outstanding block requests per peer.
pub const MAX_IN_FLIGHT_PER_PEER: u32 = 8;
/// Request failures before the engine stops using a peer.
pub const MAX_PEER_FAILURES: u32 = 3;

/// Where the engine is in the sync lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    /// Nothing to do; no peers or already caught up.
    Idle,
    /// Waiting for tip responses from peers.
    DiscoveringTips,
    /// Following the best peer's header chain.
    DownloadingHeaders { target_height: u64 },
    /// Fetching block bodies along the validated header chain.
    DownloadingBlocks,
    /// Within `gap_tolerance` of the best observed tip.
    Synced,
}

/// Work for the node to execute on behalf of the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// Ask a peer for its best tip (send `hello`).
    RequestTip(PeerId),
    /// Ask a peer for headers after `from_hash`.
    RequestHeaders { peer: PeerId, from_hash: Hash256, count: u32 },
    /// Ask a peer for a block body.
    RequestBlock { peer: PeerId, hash: Hash256 },
    /// Connect a downloaded block; emitted strictly in chain order.
    ConnectBlock(Block),
    /// Stop talking to a peer that served invalid data.
    DiscardPeer(PeerId),
    /// The engine reached the Synced phase.
    Complete,
}

/// Per-peer sync bookkeeping.
#[derive(Clone, Debug)]
struct PeerSync {
    tip_height: u64,
    tip_hash: Hash256,
    claimed_work: ChainWork,
    in_flight: u32,
    failures: u32,
    last_request: Option<Instant>,
    discarded: bool,
}

impl PeerSync {
    fn fresh() -> Self {
        Self {
            tip_height: 0,
            tip_hash: Hash256::ZERO,
            claimed_work: ChainWork::ZERO,
            in_flight: 0,
            failures: 0,
            last_request: None,
            discarded: false,
        }
    }

    fn usable(&self) -> bool {
        !self.discarded && self.failures < MAX_PEER_FAILURES
    }
}

/// Headers-first sync engine.
pub struct SyncEngine {
    params: NetworkParams,
    phase: SyncPhase,
    peers: HashMap<PeerId, PeerSync>,
    /// Local tip the node last reported.
    local_height: u64,
    local_hash: Hash256,
    local_work: ChainWork,
    /// Validated headers awaiting body download, in chain order.
    header_chain: VecDeque<BlockHeader>,
    /// Bodies to fetch, in chain order.
    download_queue: VecDeque<Hash256>,
    /// hash → peer serving it.
    in_flight: HashMap<Hash256, PeerId>,
    /// Out-of-order bodies waiting for their predecessors.
    ready: HashMap<Hash256, Block>,
    /// Next body (by hash) owed to the chain, in order.
    connect_order: VecDeque<Hash256>,
    request_timeout: Duration,
}

impl SyncEngine {
    pub fn new(params: NetworkParams) -> Self {
        let request_timeout = Duration::from_secs(params.peer_rpc_timeout_s);
        Self {
            params,
            phase: SyncPhase::Idle,
            peers: HashMap::new(),
            local_height: 0,
            local_hash: Hash256::ZERO,
            local_work: ChainWork::ZERO,
            header_chain: VecDeque::new(),
            download_queue: VecDeque::new(),
            in_flight: HashMap::new(),
            ready: HashMap::new(),
            connect_order: VecDeque::new(),
            request_timeout,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Report the node's current tip. Called at startup and on every commit.
    pub fn set_local_tip(&mut self, height: u64, hash: Hash256, work: ChainWork) {
        self.local_height = height;
        self.local_hash = hash;
        self.local_work = work;
    }

    /// Abandon in-flight sync work (e.g. after a reorg changed the tip).
    pub fn cancel_downloads(&mut self) {
        self.header_chain.clear();
        self.download_queue.clear();
        self.in_flight.clear();
        self.ready.clear();
        self.connect_order.clear();
        for peer in self.peers.values_mut() {
            peer.in_flight = 0;
        }
        if matches!(self.phase, SyncPhase::DownloadingHeaders { .. } | SyncPhase::DownloadingBlocks)
        {
            self.phase = SyncPhase::DiscoveringTips;
        }
    }

    /// A peer connected: ask it for its tip.
    pub fn on_peer_connected(&mut self, peer: PeerId) -> Vec<SyncAction> {
        self.peers.entry(peer).or_insert_with(PeerSync::fresh);
        if self.phase == SyncPhase::Idle {
            self.phase = SyncPhase::DiscoveringTips;
        }
        vec![SyncAction::RequestTip(peer)]
    }

    /// A peer disconnected: requeue whatever it was serving.
    pub fn on_peer_disconnected(&mut self, peer: PeerId) -> Vec<SyncAction> {
        self.peers.remove(&peer);
        let mut requeue: Vec<Hash256> = self
            .in_flight
            .iter()
            .filter(|(_, p)| **p == peer)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &requeue {
            self.in_flight.remove(hash);
        }
        requeue.reverse();
        for hash in requeue {
            self.download_queue.push_front(hash);
        }
        self.dispatch_downloads(Instant::now())
    }

    /// A peer reported its tip.
    pub fn on_peer_tip(
        &mut self,
        peer: PeerId,
        height: u64,
        hash: Hash256,
        work: ChainWork,
        now: Instant,
    ) -> Vec<SyncAction> {
        let entry = self.peers.entry(peer).or_insert_with(PeerSync::fresh);
        entry.tip_height = height;
        entry.tip_hash = hash;
        entry.claimed_work = work;
        debug!(%peer, height, "sync: peer tip");

        if !matches!(self.phase, SyncPhase::Idle | SyncPhase::DiscoveringTips | SyncPhase::Synced) {
            return Vec::new();
        }

        // Follow the best claimed work, but only if it is actually ahead.
        let Some((best_peer, best)) = self.best_peer() else { return Vec::new() };
        if best.claimed_work <= self.local_work
            || best.tip_height <= self.local_height + self.params.gap_tolerance
        {
            if self.phase == SyncPhase::DiscoveringTips {
                self.phase = SyncPhase::Synced;
                return vec![SyncAction::Complete];
            }
            return Vec::new();
        }

        let target_height = best.tip_height;
        info!(%best_peer, target_height, "sync: downloading headers");
        self.phase = SyncPhase::DownloadingHeaders { target_height };
        self.header_chain.clear();
        self.mark_request(&best_peer, now);
        vec![SyncAction::RequestHeaders {
            peer: best_peer,
            from_hash: self.local_hash,
            count: self.params.header_batch as u32,
        }]
    }

    fn best_peer(&self) -> Option<(PeerId, PeerSync)> {
        self.peers
            .iter()
            .filter(|(_, p)| p.usable())
            .max_by_key(|(_, p)| (p.claimed_work, p.tip_height))
            .map(|(id, p)| (*id, p.clone()))
    }

    fn mark_request(&mut self, peer: &PeerId, now: Instant) {
        if let Some(p) = self.peers.get_mut(peer) {
            p.last_request = Some(now);
        }
    }

    /// A batch of headers arrived.
    pub fn on_headers(
        &mut self,
        peer: PeerId,
        headers: Vec<BlockHeader>,
        now: Instant,
    ) -> Vec<SyncAction> {
        let SyncPhase::DownloadingHeaders { target_height } = self.phase else {
            return Vec::new();
        };

        if let Err(reason) = self.validate_header_batch(&headers) {
            warn!(%peer, reason, "sync: invalid headers, discarding peer");
            return self.discard_and_retry(peer, now);
        }

        for header in headers {
            self.header_chain.push_back(header);
        }

        let reached = self
            .header_chain
            .back()
            .map(|h| h.height >= target_height)
            .unwrap_or(false);

        if !reached {
            let from_hash = self
                .header_chain
                .back()
                .map(|h| h.hash())
                .unwrap_or(self.local_hash);
            self.mark_request(&peer, now);
            return vec![SyncAction::RequestHeaders {
                peer,
                from_hash,
                count: self.params.header_batch as u32,
            }];
        }

        // Header chain complete: queue every body and start fetching.
        info!(headers = self.header_chain.len(), "sync: header chain validated");
        self.phase = SyncPhase::DownloadingBlocks;
        for header in &self.header_chain {
            let hash = header.hash();
            self.download_queue.push_back(hash);
            self.connect_order.push_back(hash);
        }
        self.dispatch_downloads(now)
    }

    /// Linkage, PoW, monotone heights, and checkpoint pins for one batch.
    fn validate_header_batch(&self, headers: &[BlockHeader]) -> Result<(), &'static str> {
        if headers.is_empty() {
            return Err("empty batch");
        }
        let pins = checkpoint::checkpoints_for(self.params.network);
        let (mut prev_hash, mut prev_height) = match self.header_chain.back() {
            Some(last) => (last.hash(), last.height),
            None => (self.local_hash, self.local_height),
        };
        for header in headers {
            if header.prev_hash != prev_hash {
                return Err("broken linkage");
            }
            if header.height != prev_height + 1 {
                return Err("non-monotone height");
            }
            let hash = header.hash();
            if !difficulty::check_pow(&hash, header.difficulty_bits) {
                return Err("failed pow");
            }
            if checkpoint::check_checkpoint(pins, header.height, &hash).is_err() {
                return Err("checkpoint mismatch");
            }
            prev_hash = hash;
            prev_height = header.height;
        }
        Ok(())
    }

    /// Discard a peer and restart the current phase with the next best one.
    fn discard_and_retry(&mut self, peer: PeerId, now: Instant) -> Vec<SyncAction> {
        if let Some(p) = self.peers.get_mut(&peer) {
            p.discarded = true;
            p.in_flight = 0;
        }
        let mut actions = vec![SyncAction::DiscardPeer(peer)];

        match self.phase {
            SyncPhase::DownloadingHeaders { .. } => {
                self.header_chain.clear();
                if let Some((next_peer, _)) = self.best_peer() {
                    self.mark_request(&next_peer, now);
                    actions.push(SyncAction::RequestHeaders {
                        peer: next_peer,
                        from_hash: self.local_hash,
                        count: self.params.header_batch as u32,
                    });
                } else {
                    self.phase = SyncPhase::DiscoveringTips;
                }
            }
            SyncPhase::DownloadingBlocks => {
                let requeue: Vec<Hash256> = self
                    .in_flight
                    .iter()
                    .filter(|(_, p)| **p == peer)
                    .map(|(h, _)| *h)
                    .collect();
                for hash in requeue {
                    self.in_flight.remove(&hash);
                    self.download_queue.push_front(hash);
                }
                actions.extend(self.dispatch_downloads(now));
            }
            _ => {}
        }
        actions
    }

    /// Hand out queued downloads across usable peers, respecting per-peer
    /// in-flight caps.
    fn dispatch_downloads(&mut self, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        while let Some(&hash) = self.download_queue.front() {
            let Some((peer_id, _)) = self
                .peers
                .iter()
                .filter(|(_, p)| p.usable() && p.in_flight < MAX_IN_FLIGHT_PER_PEER)
                .max_by_key(|(_, p)| p.tip_height)
                .map(|(id, p)| (*id, p.clone()))
            else {
                break;
            };

            self.download_queue.pop_front();
            self.in_flight.insert(hash, peer_id);
            if let Some(p) = self.peers.get_mut(&peer_id) {
                p.in_flight += 1;
                p.last_request = Some(now);
            }
            actions.push(SyncAction::RequestBlock { peer: peer_id, hash });
        }
        actions
    }

    /// A block body arrived. Emits `ConnectBlock` for every block whose
    /// predecessors have all arrived, preserving chain order.
    pub fn on_block(&mut self, peer: PeerId, block: Block, now: Instant) -> Vec<SyncAction> {
        let hash = block.hash();
        if self.in_flight.remove(&hash).is_some() {
            if let Some(p) = self.peers.get_mut(&peer) {
                p.in_flight = p.in_flight.saturating_sub(1);
            }
        }
        self.ready.insert(hash, block);

        let mut actions = Vec::new();
        while let Some(next) = self.connect_order.front() {
            match self.ready.remove(next) {
                Some(block) => {
                    self.connect_order.pop_front();
                    actions.push(SyncAction::ConnectBlock(block));
                }
                None => break,
            }
        }
        actions.extend(self.dispatch_downloads(now));

        if self.connect_order.is_empty()
            && self.download_queue.is_empty()
            && self.in_flight.is_empty()
            && self.phase == SyncPhase::DownloadingBlocks
        {
            self.phase = SyncPhase::Synced;
            self.header_chain.clear();
            info!("sync: complete");
            actions.push(SyncAction::Complete);
        }
        actions
    }

    /// Reassign requests that have outlived the RPC deadline; peers that
    /// keep timing out stop being used.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<SyncAction> {
        let mut timed_out_peers: Vec<PeerId> = Vec::new();
        let timeout = self.request_timeout;
        let mut requeue: Vec<Hash256> = Vec::new();

        for (hash, peer) in &self.in_flight {
            let expired = self
                .peers
                .get(peer)
                .and_then(|p| p.last_request)
                .is_some_and(|t| now.saturating_duration_since(t) >= timeout);
            if expired {
                requeue.push(*hash);
                timed_out_peers.push(*peer);
            }
        }

        for hash in &requeue {
            self.in_flight.remove(hash);
            self.download_queue.push_front(*hash);
        }
        for peer in timed_out_peers {
            if let Some(p) = self.peers.get_mut(&peer) {
                p.failures += 1;
                p.in_flight = 0;
                if !p.usable() {
                    warn!(%peer, failures = p.failures, "sync: peer unusable after timeouts");
                }
            }
        }

        self.dispatch_downloads(now)
    }

    /// Blocks the engine still owes the chain (for progress reporting).
    pub fn remaining(&self) -> usize {
        self.connect_order.len()
    }
}
