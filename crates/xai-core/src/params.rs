//! Per-network protocol parameters.
//!
//! Everything consensus-tunable lives here and is passed explicitly into the
//! components that need it — there are no process-wide singletons. Subsidy
//! amounts, the halving interval, and the supply cap are data in the
//! [`subsidy_schedule`](NetworkParams::subsidy_schedule), never constants
//! baked into logic.

use crate::address::Network;
use crate::constants::{COIN, DEFAULT_P2P_PORT};
use crate::error::ConfigError;

/// One step of the subsidy schedule: from `start_height` onward the per-block
/// subsidy is `subsidy`, until the next step takes over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubsidyStep {
    pub start_height: u64,
    pub subsidy: u64,
}

/// The complete parameter set for one XAI network.
#[derive(Clone, Debug)]
pub struct NetworkParams {
    /// Which network these parameters describe (selects the address prefix).
    pub network: Network,
    /// Wire magic bytes prefixed to every frame.
    pub magic: [u8; 4],
    /// Desired average seconds between blocks.
    pub target_block_time_s: u64,
    /// Blocks between difficulty retargets.
    pub retarget_interval: u64,
    /// Bound on the per-retarget multiplier (both directions).
    pub max_adjustment: u64,
    /// Easiest allowed target, compact-encoded. Also the genesis difficulty.
    pub pow_limit_bits: u32,
    /// Confirmations before a coinbase output is spendable.
    pub coinbase_maturity: u64,
    /// Height → subsidy halving schedule, ascending by start height.
    /// Height 0 (genesis) never mints; the schedule applies from height 1.
    pub subsidy_schedule: Vec<SubsidyStep>,
    /// Hard cap on the sum of all subsidies.
    pub max_supply: u64,
    /// Upper bound on a serialized block.
    pub max_block_bytes: usize,
    /// Upper bound on one serialized transaction.
    pub max_tx_bytes: usize,
    /// Minimum fee for mempool acceptance, in micro-units.
    pub min_relay_fee: u64,
    /// Refuse reorganizations deeper than this.
    pub max_reorg_depth: u64,
    /// P2P envelope replay window, seconds.
    pub nonce_ttl_s: u64,
    /// Tolerated clock skew for block timestamps, seconds.
    pub max_clock_skew_s: u64,
    /// Blocks between UTXO checkpoints.
    pub checkpoint_interval: u64,
    /// Mempool capacity in serialized bytes.
    pub mempool_max_bytes: usize,
    /// Mempool entry time-to-live, seconds.
    pub mempool_ttl_s: u64,
    /// Required fee-rate bump for replace-by-fee, percent.
    pub rbf_bump_percent: u64,
    /// Gossip fan-out per announcement.
    pub peer_fanout: usize,
    /// Per-peer message rate limit, messages per second.
    pub max_msg_rate: u32,
    /// Per-peer inbound bandwidth limit, bytes per second.
    pub max_bw_in: u64,
    /// Replay cache capacity (envelope nonces).
    pub replay_cache_max: usize,
    /// Reputation below this triggers a ban.
    pub ban_threshold: u8,
    /// Ban duration, seconds.
    pub ban_duration_s: u64,
    /// Headers per sync batch.
    pub header_batch: u64,
    /// Height gap to peer tips below which the node is considered synced.
    pub gap_tolerance: u64,
    /// Deadline for one outbound peer request, seconds.
    pub peer_rpc_timeout_s: u64,
    /// Fixed genesis block timestamp.
    pub genesis_timestamp: u64,
    /// Well-known peers to dial at startup.
    pub bootstrap_peers: Vec<String>,
    /// Default P2P listen port.
    pub default_port: u16,
}

impl NetworkParams {
    /// Mainnet parameters: 60 XAI initial subsidy, halvings every 1,050,000
    /// blocks, 126M XAI supply cap.
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            magic: *b"XAI\x00",
            target_block_time_s: 60,
            retarget_interval: 120,
            max_adjustment: 4,
            pow_limit_bits: 0x1e00_ffff,
            coinbase_maturity: 100,
            subsidy_schedule: halving_schedule(60 * COIN, 1_050_000, 1, 33),
            max_supply: 126_000_000 * COIN,
            max_block_bytes: 1_048_576,
            max_tx_bytes: 102_400,
            min_relay_fee: 1_000,
            max_reorg_depth: 100,
            nonce_ttl_s: 120,
            max_clock_skew_s: 120,
            checkpoint_interval: 1_000,
            mempool_max_bytes: 8 * 1024 * 1024,
            mempool_ttl_s: 48 * 3600,
            rbf_bump_percent: 10,
            peer_fanout: 8,
            max_msg_rate: 50,
            max_bw_in: 4 * 1024 * 1024,
            replay_cache_max: 65_536,
            ban_threshold: 20,
            ban_duration_s: 24 * 3600,
            header_batch: 500,
            gap_tolerance: 2,
            peer_rpc_timeout_s: 30,
            genesis_timestamp: 1_735_689_600, // 2025-01-01T00:00:00Z
            bootstrap_peers: vec![
                "seed1.xai.network:19333".to_string(),
                "seed2.xai.network:19333".to_string(),
            ],
            default_port: DEFAULT_P2P_PORT,
        }
    }

    /// Testnet: mainnet rules with a looser PoW limit and no seeds.
    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            magic: *b"TXAI",
            pow_limit_bits: 0x1f00_ffff,
            genesis_timestamp: 1_735_776_000,
            bootstrap_peers: Vec::new(),
            default_port: DEFAULT_P2P_PORT + 1,
            ..Self::mainnet()
        }
    }

    /// Regtest: instant blocks for local development and tests. The PoW
    /// limit accepts roughly half of all hashes.
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            magic: *b"RXAI",
            pow_limit_bits: 0x207f_ffff,
            target_block_time_s: 1,
            retarget_interval: 16,
            coinbase_maturity: 4,
            max_reorg_depth: 10,
            checkpoint_interval: 8,
            subsidy_schedule: halving_schedule(60 * COIN, 150, 1, 33),
            genesis_timestamp: 1_735_862_400,
            bootstrap_peers: Vec::new(),
            default_port: DEFAULT_P2P_PORT + 2,
            ..Self::mainnet()
        }
    }

    /// Parameters for a named network.
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// WAL records retained: the refusal depth plus a small buffer so a
    /// failed reorg can always restore the pre-reorg tip.
    pub fn wal_retention(&self) -> u64 {
        self.max_reorg_depth + 8
    }

    /// Sanity-check the parameter set. Fatal at startup when violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_block_time_s == 0 {
            return Err(ConfigError::Invalid {
                field: "target_block_time_s",
                reason: "must be positive".into(),
            });
        }
        if self.retarget_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "retarget_interval",
                reason: "must be positive".into(),
            });
        }
        if self.max_adjustment < 2 {
            return Err(ConfigError::Invalid {
                field: "max_adjustment",
                reason: "must be at least 2".into(),
            });
        }
        if self.subsidy_schedule.is_empty() {
            return Err(ConfigError::Invalid {
                field: "subsidy_schedule",
                reason: "must contain at least one step".into(),
            });
        }
        if !self.subsidy_schedule.windows(2).all(|w| w[0].start_height < w[1].start_height) {
            return Err(ConfigError::Invalid {
                field: "subsidy_schedule",
                reason: "steps must be strictly ascending by height".into(),
            });
        }
        if self.subsidy_schedule[0].start_height != 1 {
            return Err(ConfigError::Invalid {
                field: "subsidy_schedule",
                reason: "first step must start at height 1".into(),
            });
        }
        if self.max_tx_bytes > self.max_block_bytes {
            return Err(ConfigError::Invalid {
                field: "max_tx_bytes",
                reason: "cannot exceed max_block_bytes".into(),
            });
        }
        if self.max_reorg_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "max_reorg_depth",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Build a halving schedule: `initial` subsidy from height 1, halved every
/// `interval` blocks, for `halvings` steps (after which the subsidy is 0).
fn halving_schedule(initial: u64, interval: u64, first_height: u64, halvings: u32) -> Vec<SubsidyStep> {
    let mut steps = Vec::with_capacity(halvings as usize + 1);
    let mut subsidy = initial;
    let mut height = first_height;
    for _ in 0..halvings {
        if subsidy == 0 {
            break;
        }
        steps.push(SubsidyStep { start_height: height, subsidy });
        subsidy /= 2;
        height += interval;
    }
    steps.push(SubsidyStep { start_height: height, subsidy: 0 });
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_networks_validate() {
        NetworkParams::mainnet().validate().unwrap();
        NetworkParams::testnet().validate().unwrap();
        NetworkParams::regtest().validate().unwrap();
    }

    #[test]
    fn networks_have_distinct_magic() {
        let m = NetworkParams::mainnet().magic;
        let t = NetworkParams::testnet().magic;
        let r = NetworkParams::regtest().magic;
        assert_ne!(m, t);
        assert_ne!(m, r);
        assert_ne!(t, r);
    }

    #[test]
    fn halving_schedule_halves() {
        let steps = halving_schedule(64, 10, 1, 4);
        assert_eq!(steps[0], SubsidyStep { start_height: 1, subsidy: 64 });
        assert_eq!(steps[1], SubsidyStep { start_height: 11, subsidy: 32 });
        assert_eq!(steps[2], SubsidyStep { start_height: 21, subsidy: 16 });
        assert_eq!(steps[3], SubsidyStep { start_height: 31, subsidy: 8 });
        assert_eq!(steps.last().unwrap().subsidy, 0);
    }

    #[test]
    fn invalid_schedule_rejected() {
        let mut p = NetworkParams::regtest();
        p.subsidy_schedule = vec![];
        assert!(p.validate().is_err());

        let mut p = NetworkParams::regtest();
        p.subsidy_schedule = vec![SubsidyStep { start_height: 5, subsidy: 1 }];
        assert!(p.validate().is_err(), "schedule must start at height 1");
    }

    #[test]
    fn zero_block_time_rejected() {
        let mut p = NetworkParams::regtest();
        p.target_block_time_s = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn wal_retention_exceeds_reorg_depth() {
        let p = NetworkParams::mainnet();
        assert!(p.wal_retention() > p.max_reorg_depth);
    }
}
