//! Adversarial cases: oversized blocks, subsidy theft, bad proof-of-work,
//! and peer replay/reputation handling.

use std::time::Instant;

use xai_core::block_validation;
use xai_core::codec::Encodable;
use xai_core::difficulty;
use xai_core::error::{BlockError, ChainError, ErrorKind, NetworkError, XaiError};
use xai_core::merkle;
use xai_core::types::{Hash256, Transaction};
use xai_network::envelope::{ReplayGuard, SignedEnvelope};
use xai_network::peers::{INITIAL_REPUTATION, PeerRegistry};
use xai_network::protocol::Message;
use xai_network::rate_limiter::RateLimiter;

use xai_tests::helpers::{TestNode, TestWallet};

// ----------------------------------------------------------------------
// Block size boundary
// ----------------------------------------------------------------------

#[test]
fn block_at_exact_size_limit_passes_one_byte_over_fails() {
    let harness = TestNode::regtest();
    let block = harness.build_mined_block(TestWallet::new(0x0A).address);
    let size = block.encoded_len();

    let mut exact = harness.params.clone();
    exact.max_block_bytes = size;
    block_validation::validate_block_structure(&block, &exact).unwrap();

    let mut tight = harness.params.clone();
    tight.max_block_bytes = size - 1;
    assert!(matches!(
        block_validation::validate_block_structure(&block, &tight),
        Err(BlockError::OversizedBlock { .. })
    ));
}

// ----------------------------------------------------------------------
// Subsidy theft
// ----------------------------------------------------------------------

#[test]
fn greedy_coinbase_is_a_consensus_error() {
    let harness = TestNode::regtest();
    let mut block = harness.build_mined_block(TestWallet::new(0x0A).address);

    // Claim one micro-unit more than subsidy + fees, re-commit, re-mine.
    block.transactions[0].outputs[0].amount += 1;
    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
    block.header.merkle_root = merkle::merkle_root(&txids);
    block.header.nonce = 0;
    while !difficulty::check_pow(&block.hash(), block.header.difficulty_bits) {
        block.header.nonce += 1;
    }

    let err = harness.node.submit_block(block, None).unwrap_err();
    assert!(matches!(
        err,
        XaiError::Chain(ChainError::Block(BlockError::InvalidCoinbaseAmount { .. }))
    ));
    assert_eq!(err.kind(), ErrorKind::Consensus);
    assert_eq!(harness.tip_height(), 0, "nothing was committed");
}

// ----------------------------------------------------------------------
// Proof-of-work forgery
// ----------------------------------------------------------------------

#[test]
fn block_without_valid_pow_rejected() {
    let harness = TestNode::regtest();
    let mut block = harness.build_mined_block(TestWallet::new(0x0A).address);
    // Walk the nonce until the hash no longer meets the target.
    loop {
        block.header.nonce = block.header.nonce.wrapping_add(1);
        if !difficulty::check_pow(&block.hash(), block.header.difficulty_bits) {
            break;
        }
    }

    let err = harness.node.submit_block(block, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consensus);
}

#[test]
fn forged_easy_difficulty_rejected() {
    // A block claiming an easier target than the schedule demands fails the
    // difficulty match even though its PoW satisfies its own claim.
    let harness = TestNode::regtest();
    let mut block = harness.build_mined_block(TestWallet::new(0x0A).address);
    block.header.difficulty_bits = 0x2100_ffff; // easier than the regtest limit
    block.header.nonce = 0;
    while !difficulty::check_pow(&block.hash(), block.header.difficulty_bits) {
        block.header.nonce += 1;
    }

    let err = harness.node.submit_block(block, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consensus);
}

// ----------------------------------------------------------------------
// Peer envelope replay
// ----------------------------------------------------------------------

#[test]
fn replayed_envelope_rejected_and_reputation_debited() {
    let nonce_ttl = 120;
    let mut guard = ReplayGuard::new(nonce_ttl, 1024);
    let registry = PeerRegistry::new(20, 3_600);

    let peer_key = xai_core::crypto::KeyPair::from_secret_bytes(&[0x44; 32]).unwrap();
    let peer = registry.register(peer_key.public_key().to_bytes(), "10.0.0.9:19335", 1_000);
    assert_eq!(registry.reputation(&peer), Some(INITIAL_REPUTATION));

    let envelope = SignedEnvelope::seal(&peer_key, 17, 1_000, Message::Ping(1).encode());
    envelope.verify().unwrap();
    guard.check_and_record(&envelope, 1_000).unwrap();

    // Identical envelope 10 seconds later (well inside the 120s window).
    let err = guard.check_and_record(&envelope, 1_010).unwrap_err();
    assert_eq!(err, NetworkError::ReplayedNonce);

    registry.debit(&peer, err.kind(), 1_010);
    assert!(registry.reputation(&peer).unwrap() < INITIAL_REPUTATION);
    assert!(!registry.is_banned(&peer, 1_010));
}

#[test]
fn persistent_abuse_leads_to_ban_and_silence() {
    let registry = PeerRegistry::new(20, 3_600);
    let peer_key = xai_core::crypto::KeyPair::from_secret_bytes(&[0x45; 32]).unwrap();
    let peer = registry.register(peer_key.public_key().to_bytes(), "10.0.0.9:19335", 0);

    // Keep shipping consensus-invalid objects until the ban lands.
    let mut banned = false;
    for _ in 0..10 {
        banned = registry.debit(&peer, ErrorKind::Consensus, 0) || banned;
    }
    assert!(banned);
    assert!(registry.is_banned(&peer, 1_000));
    // Fan-out never selects a banned peer.
    assert!(registry.random_peers(8, None, 1_000).is_empty());
}

// ----------------------------------------------------------------------
// Rate-limit flood
// ----------------------------------------------------------------------

#[test]
fn message_flood_is_throttled_per_peer() {
    let mut limiter = RateLimiter::new(50, 1 << 20);
    let registry = PeerRegistry::new(20, 3_600);
    let key = xai_core::crypto::KeyPair::from_secret_bytes(&[0x46; 32]).unwrap();
    let flooder = registry.register(key.public_key().to_bytes(), "10.0.0.7:19335", 0);
    let now = Instant::now();

    let mut dropped = 0;
    for _ in 0..200 {
        if !limiter.admit(&flooder, 64, now) {
            dropped += 1;
            registry.debit(&flooder, ErrorKind::RateLimit, 0);
        }
    }
    assert_eq!(dropped, 150, "everything past the burst allowance drops");
    assert!(registry.reputation(&flooder).unwrap() < INITIAL_REPUTATION);
}

// ----------------------------------------------------------------------
// Deep fork refusal survives restarts of the attempt
// ----------------------------------------------------------------------

#[test]
fn node_state_untouched_after_rejected_blocks() {
    let harness = TestNode::regtest();
    let miner = TestWallet::new(0x0A).address;
    harness.mine(3, miner);
    let before = harness.node.status();

    for _ in 0..3 {
        let mut bad = harness.build_mined_block(miner);
        bad.transactions[0].outputs[0].amount += 1;
        let txids: Vec<Hash256> = bad.transactions.iter().map(Transaction::txid).collect();
        bad.header.merkle_root = merkle::merkle_root(&txids);
        bad.header.nonce = 0;
        while !difficulty::check_pow(&bad.hash(), bad.header.difficulty_bits) {
            bad.header.nonce += 1;
        }
        assert!(harness.node.submit_block(bad, None).is_err());
    }

    let after = harness.node.status();
    assert_eq!(after.height, before.height);
    assert_eq!(after.tip_hash, before.tip_hash);
    assert_eq!(after.total_supply, before.total_supply);
}
