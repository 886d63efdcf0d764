//! Deterministic genesis block construction.
//!
//! The genesis block is fixed per network: height 0, zero parent, the
//! network's PoW limit as its difficulty, and a coinbase that mints nothing
//! (the subsidy schedule starts at height 1). It is trusted by construction
//! and never passes through block validation.

use crate::address::Address;
use crate::merkle;
use crate::params::NetworkParams;
use crate::types::{Block, BlockHeader, Hash256, Transaction};

/// The address credited by genesis coinbases: the all-zero hash160. No key
/// hashes to it, so nothing is spendable even if a schedule minted at 0.
pub fn genesis_address(params: &NetworkParams) -> Address {
    Address::from_hash160([0u8; 20], params.network)
}

/// Build the genesis block for a network.
pub fn genesis_block(params: &NetworkParams) -> Block {
    let miner = genesis_address(params);
    let coinbase = Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![],
        locktime: 0,
        sender: miner,
        sender_pubkey: [0u8; 33],
        signature: [0u8; 64],
        nonce: 0,
        fee: 0,
        memo: Some(format!("xai {} genesis", params.network)),
        replaces_txid: None,
        rbf: false,
    };
    let merkle_root = merkle::merkle_root(&[coinbase.txid()]);

    Block {
        header: BlockHeader {
            version: 1,
            height: 0,
            prev_hash: Hash256::ZERO,
            merkle_root,
            timestamp: params.genesis_timestamp,
            difficulty_bits: params.pow_limit_bits,
            nonce: 0,
            miner,
        },
        transactions: vec![coinbase],
    }
}

/// The genesis block hash for a network.
pub fn genesis_hash(params: &NetworkParams) -> Hash256 {
    genesis_block(params).hash()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_deterministic() {
        let p = NetworkParams::mainnet();
        assert_eq!(genesis_block(&p), genesis_block(&p));
        assert_eq!(genesis_hash(&p), genesis_hash(&p));
    }

    #[test]
    fn networks_have_distinct_genesis() {
        let mainnet = genesis_hash(&NetworkParams::mainnet());
        let testnet = genesis_hash(&NetworkParams::testnet());
        let regtest = genesis_hash(&NetworkParams::regtest());
        assert_ne!(mainnet, testnet);
        assert_ne!(mainnet, regtest);
        assert_ne!(testnet, regtest);
    }

    #[test]
    fn genesis_shape() {
        let p = NetworkParams::regtest();
        let block = genesis_block(&p);
        assert_eq!(block.header.height, 0);
        assert_eq!(block.header.prev_hash, Hash256::ZERO);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
        assert!(block.transactions[0].outputs.is_empty());
        assert_eq!(
            block.header.merkle_root,
            merkle::merkle_root(&[block.transactions[0].txid()])
        );
    }
}
