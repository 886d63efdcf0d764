//! Peer registry: identity, trust, reputation, and bans.
//!
//! A peer is identified by the SHA-256 fingerprint of its compressed public
//! key. Each peer carries a trust state, a reputation score in `0..=100`
//! (monotone counters, debited on misbehaviour per the error taxonomy and
//! credited for useful work), message/byte counters, and a last-seen time.
//! Reputation below the ban threshold bans the peer for the configured
//! duration.
//!
//! Entries live in a [`DashMap`] so reputation math takes per-peer locks;
//! nothing here ever mutates chain state.

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use xai_core::constants::PUBKEY_BYTES;
use xai_core::error::ErrorKind;
use xai_core::types::Hash256;

/// Peer identifier: SHA-256 fingerprint of the peer's compressed pubkey.
pub type PeerId = Hash256;

/// Reputation every new unknown peer starts with.
pub const INITIAL_REPUTATION: u8 = 50;
/// Reputation ceiling.
pub const MAX_REPUTATION: u8 = 100;

/// Debit for a stateless validation failure (`S` in the taxonomy).
pub const DEBIT_VALIDATION: u8 = 5;
/// Debit for a consensus-rule violation (`2·S`).
pub const DEBIT_CONSENSUS: u8 = 10;
/// Debit for tripping a rate limit.
pub const DEBIT_RATE_LIMIT: u8 = 1;
/// Credit for a useful object (valid block, valid headers).
pub const CREDIT_USEFUL: u8 = 2;

/// How a peer is trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustState {
    /// Operator-configured peer; never banned automatically.
    Trusted,
    /// Ordinary discovered peer.
    Unknown,
    /// Banned until the recorded expiry.
    Banned,
}

/// Per-peer record.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: PeerId,
    pub pubkey: [u8; PUBKEY_BYTES],
    pub endpoint: String,
    pub trust: TrustState,
    /// Reputation score, `0..=100`.
    pub reputation: u8,
    /// Unix seconds of the last accepted message.
    pub last_seen: u64,
    /// Total messages accepted from this peer.
    pub messages_in: u64,
    /// Total payload bytes accepted from this peer.
    pub bytes_in: u64,
    /// Unix second the current ban lapses, if banned.
    banned_until: Option<u64>,
}

/// Registry of all known peers.
pub struct PeerRegistry {
    peers: DashMap<PeerId, PeerInfo>,
    ban_threshold: u8,
    ban_duration_s: u64,
}

impl PeerRegistry {
    pub fn new(ban_threshold: u8, ban_duration_s: u64) -> Self {
        Self { peers: DashMap::new(), ban_threshold, ban_duration_s }
    }

    /// Add or refresh a peer. Existing reputation and counters survive.
    pub fn register(&self, pubkey: [u8; PUBKEY_BYTES], endpoint: &str, now: u64) -> PeerId {
        let id = Hash256(xai_core::crypto::sha256(&pubkey));
        self.peers
            .entry(id)
            .and_modify(|p| {
                p.endpoint = endpoint.to_string();
                p.last_seen = now;
            })
            .or_insert_with(|| {
                debug!(peer = %id, endpoint, "peers: registered");
                PeerInfo {
                    id,
                    pubkey,
                    endpoint: endpoint.to_string(),
                    trust: TrustState::Unknown,
                    reputation: INITIAL_REPUTATION,
                    last_seen: now,
                    messages_in: 0,
                    bytes_in: 0,
                    banned_until: None,
                }
            });
        id
    }

    /// Drop a peer entirely (registry-wide lock only here and in insert).
    pub fn remove(&self, id: &PeerId) {
        if self.peers.remove(id).is_some() {
            debug!(peer = %id, "peers: removed");
        }
    }

    /// Mark a peer as operator-trusted: exempt from automatic bans.
    pub fn mark_trusted(&self, id: &PeerId) {
        if let Some(mut p) = self.peers.get_mut(id) {
            p.trust = TrustState::Trusted;
        }
    }

    /// Record an accepted message.
    pub fn touch(&self, id: &PeerId, bytes: usize, now: u64) {
        if let Some(mut p) = self.peers.get_mut(id) {
            p.last_seen = now;
            p.messages_in += 1;
            p.bytes_in += bytes as u64;
        }
    }

    /// Debit reputation according to the error kind. Returns `true` if the
    /// debit banned the peer.
    pub fn debit(&self, id: &PeerId, kind: ErrorKind, now: u64) -> bool {
        let amount = match kind {
            ErrorKind::Validation => DEBIT_VALIDATION,
            ErrorKind::Consensus => DEBIT_CONSENSUS,
            ErrorKind::RateLimit => DEBIT_RATE_LIMIT,
            // Conflicts are usually honest races; orphans are normal.
            ErrorKind::Conflict | ErrorKind::Orphan => 0,
            _ => 0,
        };
        if amount == 0 {
            return false;
        }

        let Some(mut p) = self.peers.get_mut(id) else { return false };
        if p.trust == TrustState::Trusted {
            return false;
        }
        p.reputation = p.reputation.saturating_sub(amount);
        debug!(peer = %id, ?kind, reputation = p.reputation, "peers: reputation debited");

        if p.reputation < self.ban_threshold && p.trust != TrustState::Banned {
            p.trust = TrustState::Banned;
            p.banned_until = Some(now + self.ban_duration_s);
            warn!(peer = %id, until = now + self.ban_duration_s, "peers: banned");
            return true;
        }
        false
    }

    /// Credit reputation for useful work, capped at [`MAX_REPUTATION`].
    pub fn credit(&self, id: &PeerId, amount: u8) {
        if let Some(mut p) = self.peers.get_mut(id) {
            p.reputation = p.reputation.saturating_add(amount).min(MAX_REPUTATION);
        }
    }

    /// Ban a peer outright (e.g. repeated consensus violations).
    pub fn ban(&self, id: &PeerId, now: u64) {
        if let Some(mut p) = self.peers.get_mut(id) {
            if p.trust == TrustState::Trusted {
                return;
            }
            p.trust = TrustState::Banned;
            p.banned_until = Some(now + self.ban_duration_s);
            warn!(peer = %id, "peers: banned explicitly");
        }
    }

    /// Whether the peer is currently banned.
    pub fn is_banned(&self, id: &PeerId, now: u64) -> bool {
        match self.peers.get(id) {
            Some(p) => p.trust == TrustState::Banned && p.banned_until.is_some_and(|t| now < t),
            None => false,
        }
    }

    /// Lift lapsed bans, restoring the initial reputation. Returns the
    /// unbanned peers.
    pub fn unban_expired(&self, now: u64) -> Vec<PeerId> {
        let mut unbanned = Vec::new();
        for mut entry in self.peers.iter_mut() {
            if entry.trust == TrustState::Banned
                && entry.banned_until.is_some_and(|t| now >= t)
            {
                entry.trust = TrustState::Unknown;
                entry.banned_until = None;
                entry.reputation = INITIAL_REPUTATION;
                unbanned.push(entry.id);
                info!(peer = %entry.id, "peers: ban expired");
            }
        }
        unbanned
    }

    pub fn reputation(&self, id: &PeerId) -> Option<u8> {
        self.peers.get(id).map(|p| p.reputation)
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.get(id).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All peers currently eligible for traffic.
    pub fn active_peers(&self, now: u64) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|p| !(p.trust == TrustState::Banned && p.banned_until.is_some_and(|t| now < t)))
            .map(|p| p.id)
            .collect()
    }

    /// Up to `k` random non-banned peers, excluding `exclude` — the gossip
    /// fan-out set.
    pub fn random_peers(&self, k: usize, exclude: Option<&PeerId>, now: u64) -> Vec<PeerId> {
        let mut candidates: Vec<PeerId> = self
            .active_peers(now)
            .into_iter()
            .filter(|id| Some(id) != exclude)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(k);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_000_000;

    fn registry() -> PeerRegistry {
        // Threshold 20, one-hour bans.
        PeerRegistry::new(20, 3_600)
    }

    fn add_peer(reg: &PeerRegistry, seed: u8) -> PeerId {
        let mut pubkey = [0u8; 33];
        pubkey[0] = 2;
        pubkey[1] = seed;
        reg.register(pubkey, "127.0.0.1:19333", NOW)
    }

    #[test]
    fn new_peer_starts_at_initial_reputation() {
        let reg = registry();
        let id = add_peer(&reg, 1);
        assert_eq!(reg.reputation(&id), Some(INITIAL_REPUTATION));
        assert!(!reg.is_banned(&id, NOW));
    }

    #[test]
    fn reregistering_keeps_counters() {
        let reg = registry();
        let id = add_peer(&reg, 1);
        reg.touch(&id, 100, NOW + 1);
        add_peer(&reg, 1);
        let info = reg.get(&id).unwrap();
        assert_eq!(info.messages_in, 1);
        assert_eq!(info.bytes_in, 100);
    }

    #[test]
    fn debit_schedule_follows_error_kinds() {
        let reg = registry();
        let id = add_peer(&reg, 1);

        reg.debit(&id, ErrorKind::Validation, NOW);
        assert_eq!(reg.reputation(&id), Some(INITIAL_REPUTATION - DEBIT_VALIDATION));

        reg.debit(&id, ErrorKind::Consensus, NOW);
        assert_eq!(
            reg.reputation(&id),
            Some(INITIAL_REPUTATION - DEBIT_VALIDATION - DEBIT_CONSENSUS)
        );

        reg.debit(&id, ErrorKind::RateLimit, NOW);
        assert_eq!(
            reg.reputation(&id),
            Some(INITIAL_REPUTATION - DEBIT_VALIDATION - DEBIT_CONSENSUS - DEBIT_RATE_LIMIT)
        );
    }

    #[test]
    fn conflicts_and_orphans_cost_nothing() {
        let reg = registry();
        let id = add_peer(&reg, 1);
        reg.debit(&id, ErrorKind::Conflict, NOW);
        reg.debit(&id, ErrorKind::Orphan, NOW);
        assert_eq!(reg.reputation(&id), Some(INITIAL_REPUTATION));
    }

    #[test]
    fn repeated_consensus_failures_ban() {
        let reg = registry();
        let id = add_peer(&reg, 1);

        // 50 → 40 → 30 → 20 → 10: crossing below threshold 20 bans.
        let mut banned = false;
        for _ in 0..4 {
            banned = reg.debit(&id, ErrorKind::Consensus, NOW);
        }
        assert!(banned);
        assert!(reg.is_banned(&id, NOW));
        assert!(reg.is_banned(&id, NOW + 3_599));
        assert!(!reg.is_banned(&id, NOW + 3_600));
    }

    #[test]
    fn credit_caps_at_maximum() {
        let reg = registry();
        let id = add_peer(&reg, 1);
        for _ in 0..100 {
            reg.credit(&id, CREDIT_USEFUL);
        }
        assert_eq!(reg.reputation(&id), Some(MAX_REPUTATION));
    }

    #[test]
    fn trusted_peers_never_banned() {
        let reg = registry();
        let id = add_peer(&reg, 1);
        reg.mark_trusted(&id);

        for _ in 0..20 {
            assert!(!reg.debit(&id, ErrorKind::Consensus, NOW));
        }
        assert!(!reg.is_banned(&id, NOW));
        reg.ban(&id, NOW);
        assert!(!reg.is_banned(&id, NOW));
    }

    #[test]
    fn unban_expired_restores_reputation() {
        let reg = registry();
        let id = add_peer(&reg, 1);
        reg.ban(&id, NOW);
        assert!(reg.is_banned(&id, NOW));

        assert!(reg.unban_expired(NOW + 1).is_empty(), "ban still active");
        let unbanned = reg.unban_expired(NOW + 3_600);
        assert_eq!(unbanned, vec![id]);
        assert!(!reg.is_banned(&id, NOW + 3_600));
        assert_eq!(reg.reputation(&id), Some(INITIAL_REPUTATION));
    }

    #[test]
    fn banned_peers_excluded_from_fanout() {
        let reg = registry();
        let good: Vec<PeerId> = (1..=5).map(|s| add_peer(&reg, s)).collect();
        let bad = add_peer(&reg, 6);
        reg.ban(&bad, NOW);

        let fanout = reg.random_peers(10, None, NOW);
        assert_eq!(fanout.len(), 5);
        assert!(!fanout.contains(&bad));
        for id in &fanout {
            assert!(good.contains(id));
        }
    }

    #[test]
    fn fanout_respects_k_and_exclusion() {
        let reg = registry();
        let ids: Vec<PeerId> = (1..=8).map(|s| add_peer(&reg, s)).collect();
        let origin = ids[0];

        let fanout = reg.random_peers(3, Some(&origin), NOW);
        assert_eq!(fanout.len(), 3);
        assert!(!fanout.contains(&origin));
    }
}
