//! Node configuration for the XAI full node.
//!
//! Everything the host process can tune lives here; the consensus-critical
//! knobs stay in [`NetworkParams`] and are selected by network name.

use std::path::PathBuf;

use xai_core::address::{Address, Network};
use xai_core::error::ConfigError;
use xai_core::params::NetworkParams;
use xai_network::NetworkConfig;

/// Configuration for a full node instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Which network to join.
    pub network: Network,
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// P2P transport settings.
    pub p2p: NetworkConfig,
    /// Run without networking (single-node mode).
    pub no_network: bool,
    /// Mine blocks to this address, when set.
    pub miner_address: Option<Address>,
    /// Miner worker threads.
    pub miner_threads: usize,
    /// Log level filter string (e.g. "info", "xai_node=debug").
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let network = Network::Mainnet;
        Self {
            network,
            data_dir: default_data_dir(network),
            p2p: NetworkConfig::default(),
            no_network: false,
            miner_address: None,
            miner_threads: 1,
            log_level: "info".to_string(),
        }
    }
}

/// Platform data directory for a network: `<data>/xai/<network>`.
pub fn default_data_dir(network: Network) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("xai")
        .join(network.to_string())
}

impl NodeConfig {
    /// Consensus parameters for the configured network, with the transport
    /// bootstrap list applied.
    pub fn params(&self) -> NetworkParams {
        let mut params = NetworkParams::for_network(self.network);
        if !self.p2p.bootstrap_peers.is_empty() {
            params.bootstrap_peers = self.p2p.bootstrap_peers.clone();
        }
        params
    }

    /// Path of the chain data directory.
    pub fn chain_dir(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }

    /// Path of the node's P2P identity key.
    pub fn node_key_path(&self) -> PathBuf {
        self.data_dir.join("node.key")
    }

    /// Validate the configuration. Fatal at startup when violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.params().validate()?;
        if let Some(addr) = &self.miner_address {
            if addr.network() != self.network {
                return Err(ConfigError::Invalid {
                    field: "miner_address",
                    reason: format!(
                        "address is for {}, node runs {}",
                        addr.network(),
                        self.network
                    ),
                });
            }
        }
        if self.miner_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "miner_threads",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
