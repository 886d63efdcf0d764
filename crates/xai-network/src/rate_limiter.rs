//! Per-peer rate limiting with token buckets.
//!
//! Each peer has two buckets: one counting messages per second and one
//! counting inbound payload bytes per second. Buckets refill continuously on
//! every check; a message is admitted only when both buckets can pay for it.
//! Over-limit events are reported to the caller, which debits the peer's
//! reputation and drops the message silently.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::peers::PeerId;

/// A continuously-refilling token bucket.
#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self { capacity, tokens: capacity, refill_per_sec, last_refill: now }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `amount` tokens if available.
    fn try_take(&mut self, amount: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

/// Per-peer message and bandwidth buckets.
struct PeerBuckets {
    messages: TokenBucket,
    bytes: TokenBucket,
}

/// Token-bucket rate limiter over all connected peers.
///
/// Burst capacity is one second's allowance, so a peer can never front-load
/// more than its steady-state rate.
pub struct RateLimiter {
    max_msg_rate: u32,
    max_bw_in: u64,
    peers: HashMap<PeerId, PeerBuckets>,
}

impl RateLimiter {
    /// `max_msg_rate` in messages/second, `max_bw_in` in bytes/second.
    pub fn new(max_msg_rate: u32, max_bw_in: u64) -> Self {
        Self { max_msg_rate, max_bw_in, peers: HashMap::new() }
    }

    fn buckets(&mut self, peer: &PeerId, now: Instant) -> &mut PeerBuckets {
        self.peers.entry(*peer).or_insert_with(|| PeerBuckets {
            messages: TokenBucket::new(self.max_msg_rate as f64, self.max_msg_rate as f64, now),
            bytes: TokenBucket::new(self.max_bw_in as f64, self.max_bw_in as f64, now),
        })
    }

    /// Admit one message of `bytes` payload from `peer`, or report the peer
    /// over-limit. Charges both buckets only when both can pay.
    pub fn admit(&mut self, peer: &PeerId, bytes: usize, now: Instant) -> bool {
        let buckets = self.buckets(peer, now);
        buckets.messages.refill(now);
        buckets.bytes.refill(now);
        if buckets.messages.tokens < 1.0 || buckets.bytes.tokens < bytes as f64 {
            debug!(%peer, bytes, "rate_limiter: over limit");
            return false;
        }
        buckets.messages.tokens -= 1.0;
        buckets.bytes.tokens -= bytes as f64;
        true
    }

    /// Forget a peer's buckets (call on disconnect).
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    pub fn tracked_peers(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use xai_core::types::Hash256;

    fn peer(seed: u8) -> PeerId {
        Hash256([seed; 32])
    }

    #[test]
    fn burst_up_to_capacity_then_blocked() {
        let mut rl = RateLimiter::new(5, 1_000_000);
        let now = Instant::now();
        let p = peer(1);

        for _ in 0..5 {
            assert!(rl.admit(&p, 10, now));
        }
        assert!(!rl.admit(&p, 10, now), "sixth message in the same instant is over limit");
    }

    #[test]
    fn tokens_refill_over_time() {
        let mut rl = RateLimiter::new(5, 1_000_000);
        let start = Instant::now();
        let p = peer(1);

        for _ in 0..5 {
            assert!(rl.admit(&p, 10, start));
        }
        assert!(!rl.admit(&p, 10, start));

        // One second later the bucket has refilled its full rate.
        let later = start + Duration::from_secs(1);
        for _ in 0..5 {
            assert!(rl.admit(&p, 10, later));
        }
        assert!(!rl.admit(&p, 10, later));
    }

    #[test]
    fn bandwidth_bucket_blocks_large_payloads() {
        let mut rl = RateLimiter::new(1_000, 1_000);
        let now = Instant::now();
        let p = peer(1);

        assert!(rl.admit(&p, 900, now));
        // Message tokens remain, but bytes are exhausted.
        assert!(!rl.admit(&p, 200, now));
        // A small message still fits.
        assert!(rl.admit(&p, 50, now));
    }

    #[test]
    fn rejected_message_charges_nothing() {
        let mut rl = RateLimiter::new(1_000, 1_000);
        let now = Instant::now();
        let p = peer(1);

        // Oversized: rejected without draining the message bucket.
        assert!(!rl.admit(&p, 5_000, now));
        assert!(rl.admit(&p, 1_000, now), "full byte allowance is still available");
    }

    #[test]
    fn peers_are_limited_independently() {
        let mut rl = RateLimiter::new(1, 1_000_000);
        let now = Instant::now();

        assert!(rl.admit(&peer(1), 10, now));
        assert!(!rl.admit(&peer(1), 10, now));
        assert!(rl.admit(&peer(2), 10, now), "peer 2 has its own bucket");
        assert_eq!(rl.tracked_peers(), 2);
    }

    #[test]
    fn remove_peer_resets_its_budget() {
        let mut rl = RateLimiter::new(1, 1_000_000);
        let now = Instant::now();
        let p = peer(1);

        assert!(rl.admit(&p, 10, now));
        assert!(!rl.admit(&p, 10, now));
        rl.remove_peer(&p);
        assert!(rl.admit(&p, 10, now), "fresh bucket after re-registration");
    }
}
