//! Builders and fixtures shared by the integration suites.

use std::sync::Arc;

use tempfile::TempDir;

use xai_consensus::miner::mine_block;
use xai_core::address::{Address, Network};
use xai_core::crypto::{self, KeyPair};
use xai_core::params::NetworkParams;
use xai_core::types::{Block, Hash256, OutPoint, Transaction, TxOutput};
use xai_node::{Node, NodeConfig};
use xai_network::NetworkConfig;

/// A keypair with its regtest address.
pub struct TestWallet {
    pub keypair: KeyPair,
    pub address: Address,
}

impl TestWallet {
    pub fn new(seed: u8) -> Self {
        let keypair = KeyPair::from_secret_bytes(&[seed; 32]).expect("nonzero seed");
        let address = Address::from_public_key(&keypair.public_key(), Network::Regtest);
        Self { keypair, address }
    }

    /// Build and sign a spend.
    pub fn transfer(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOutput>,
        nonce: u64,
        fee: u64,
    ) -> Transaction {
        self.transfer_rbf(inputs, outputs, nonce, fee, false)
    }

    pub fn transfer_rbf(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOutput>,
        nonce: u64,
        fee: u64,
        rbf: bool,
    ) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs,
            outputs,
            locktime: 0,
            sender: self.address,
            sender_pubkey: [0; 33],
            signature: [0; 64],
            nonce,
            fee,
            memo: None,
            replaces_txid: None,
            rbf,
        };
        crypto::sign_transaction(&mut tx, &self.keypair);
        tx
    }
}

/// A networkless node over a temp directory, plus mining helpers.
pub struct TestNode {
    pub node: Arc<Node>,
    pub params: NetworkParams,
    // Held so the data directory outlives the node.
    _dir: TempDir,
}

impl TestNode {
    /// Regtest node with default parameters.
    pub fn regtest() -> Self {
        Self::with_network(Network::Regtest)
    }

    pub fn with_network(network: Network) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = NodeConfig {
            network,
            data_dir: dir.path().to_path_buf(),
            p2p: NetworkConfig::default(),
            no_network: true,
            miner_address: None,
            miner_threads: 1,
            log_level: "warn".into(),
        };
        let params = config.params();
        let node = Node::without_network(config).expect("node opens");
        Self { node, params, _dir: dir }
    }

    pub fn tip_height(&self) -> u64 {
        self.node.status().height
    }

    /// Mine one block to `miner` through the ordinary template/submit path.
    pub fn mine_one(&self, miner: Address) -> Block {
        let block = self.build_mined_block(miner);
        self.node.submit_block(block.clone(), None).expect("mined block connects");
        block
    }

    /// Build and solve a template without submitting it.
    pub fn build_mined_block(&self, miner: Address) -> Block {
        let mut template = self.node.build_template(miner).expect("template builds");
        assert!(mine_block(&mut template, u64::MAX));
        template
    }

    /// Mine `n` blocks to `miner`.
    pub fn mine(&self, n: u64, miner: Address) -> Vec<Block> {
        (0..n).map(|_| self.mine_one(miner)).collect()
    }

    /// Fund `wallet` with one matured coinbase; returns the spendable
    /// outpoint and its value.
    pub fn fund(&self, wallet: &TestWallet) -> (OutPoint, u64) {
        let funding = self.mine_one(wallet.address);
        let coinbase = &funding.transactions[0];
        let outpoint = OutPoint { txid: coinbase.txid(), vout: 0 };
        let value = coinbase.outputs[0].amount;
        self.mine(self.params.coinbase_maturity, TestWallet::new(0xF0).address);
        (outpoint, value)
    }
}

/// Mine a block directly on an explicit parent, bypassing the node's tip
/// (fork construction). The caller supplies the exact coinbase value.
pub fn mine_fork_block(
    params: &NetworkParams,
    parent_hash: Hash256,
    height: u64,
    timestamp: u64,
    miner: Address,
    extra: Vec<Transaction>,
    coinbase_value: u64,
) -> Block {
    use xai_core::merkle;

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
        sender_pubkey: [0; 33],
        signature: [0; 64],
        nonce: height,
        fee: 0,
        memo: Some(format!("fork@{height}")),
        replaces_txid: None,
        rbf: false,
    };
    let mut txs = vec![coinbase];
    txs.extend(extra);
    let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();

    let mut block = Block {
        header: xai_core::types::BlockHeader {
            version: 1,
            height,
            prev_hash: parent_hash,
            merkle_root: merkle::merkle_root(&txids),
            timestamp,
            difficulty_bits: params.pow_limit_bits,
            nonce: 0,
            miner,
        },
        transactions: txs,
    };
    assert!(mine_block(&mut block, u64::MAX));
    block
}

