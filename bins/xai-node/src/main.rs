//! XAI full node binary.
//!
//! `xai-node start` runs a node with file-backed storage, P2P networking,
//! and optional mining. The query subcommands (`status`, `get-block`,
//! `get-tx`, `get-utxo`) and the maintenance subcommands (`reindex`,
//! `resync-from-checkpoint`) operate on the same data directory.
//!
//! Exit codes: 0 normal shutdown, 2 invalid configuration, 3 storage
//! corruption, 4 listen port taken, 5 unrecoverable reorganization.

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use xai_core::address::{Address, Network};
use xai_core::codec::Encodable;
use xai_core::error::{ChainError, ErrorKind, XaiError};
use xai_core::types::{Hash256, OutPoint, Transaction};
use xai_network::NetworkConfig;
use xai_node_lib::{Node, NodeConfig, config::default_data_dir};

const EXIT_CONFIG: u8 = 2;
const EXIT_STORAGE: u8 = 3;
const EXIT_PORT: u8 = 4;
const EXIT_REORG: u8 = 5;

/// XAI full node.
#[derive(Parser, Debug)]
#[command(name = "xai-node", version, about = "XAI proof-of-work full node")]
struct Args {
    /// Network to join (mainnet, testnet, regtest).
    #[arg(long, default_value = "mainnet", env = "XAI_NETWORK")]
    network: String,

    /// Data directory for chain storage and keys.
    #[arg(long, env = "XAI_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// P2P listen address.
    #[arg(long, default_value = "0.0.0.0", env = "XAI_LISTEN_ADDR")]
    listen_addr: String,

    /// P2P listen port (0 = OS-assigned; default per network).
    #[arg(long, env = "XAI_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Peers to dial at startup (comma-separated host:port).
    #[arg(long, value_delimiter = ',', env = "XAI_PEERS")]
    peers: Vec<String>,

    /// Mine blocks to this address.
    #[arg(long, env = "XAI_MINER_ADDRESS")]
    miner_address: Option<String>,

    /// Miner worker threads.
    #[arg(long, default_value_t = 1, env = "XAI_MINER_THREADS")]
    threads: usize,

    /// Disable P2P networking (single-node mode).
    #[arg(long)]
    no_network: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "XAI_LOG_LEVEL")]
    log_level: String,

    /// Log output format ("text" or "json").
    #[arg(long, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node (default).
    Start,
    /// Print the node status as JSON.
    Status,
    /// Validate and submit a canonical hex-encoded transaction.
    SubmitTx { hex: String },
    /// Fetch a block by hash or height.
    GetBlock { id: String },
    /// Fetch a transaction by txid.
    GetTx { txid: String },
    /// Fetch an unspent output by `txid:vout`.
    GetUtxo { outpoint: String },
    /// Rebuild all indexes and the UTXO set from block files.
    Reindex,
    /// Truncate the chain to the newest verifying checkpoint.
    ResyncFromCheckpoint,
}

impl Args {
    fn into_config(self) -> Result<(NodeConfig, Option<Command>, String), XaiError> {
        let network = Network::from_str(&self.network).map_err(XaiError::Address)?;
        let params = xai_core::params::NetworkParams::for_network(network);
        let data_dir = self.data_dir.unwrap_or_else(|| default_data_dir(network));

        let miner_address = match &self.miner_address {
            Some(s) => Some(Address::decode_for_network(s, network).map_err(XaiError::Address)?),
            None => None,
        };

        let config = NodeConfig {
            network,
            data_dir,
            p2p: NetworkConfig {
                listen_addr: self.listen_addr,
                listen_port: self.listen_port.unwrap_or(params.default_port),
                bootstrap_peers: self.peers,
                ..NetworkConfig::default()
            },
            no_network: self.no_network,
            miner_address,
            miner_threads: self.threads,
            log_level: self.log_level,
        };
        config.validate()?;
        Ok((config, self.command, self.log_format))
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let (config, command, log_format) = match args.into_config() {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    init_logging(&config.log_level, &log_format);

    let result = match command.unwrap_or(Command::Start) {
        Command::Start => run_node(config),
        other => run_query(config, other),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(error: &XaiError) -> u8 {
    match error {
        XaiError::Chain(ChainError::ReorgTooDeep { .. } | ChainError::ReorgAborted(_)) => {
            EXIT_REORG
        }
        XaiError::Network(_) => EXIT_PORT,
        e => match e.kind() {
            ErrorKind::Config => EXIT_CONFIG,
            ErrorKind::Storage => EXIT_STORAGE,
            _ => 1,
        },
    }
}

#[tokio::main]
async fn run_node(config: NodeConfig) -> Result<(), XaiError> {
    info!("XAI node v{}", env!("CARGO_PKG_VERSION"));
    info!(network = %config.network, data_dir = %config.data_dir.display(), "starting");

    std::fs::create_dir_all(&config.data_dir).map_err(|e| XaiError::Storage(e.to_string()))?;
    let node = Node::new(config).await?;

    let status = node.status();
    info!(height = status.height, tip = %status.tip_hash, "chain loaded");

    let runner = tokio::spawn(Arc::clone(&node).run());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| XaiError::Storage(e.to_string()))?;
    info!("received ctrl-c, shutting down");
    node.stop();
    let _ = runner.await;
    info!("shutdown complete");
    Ok(())
}

fn run_query(config: NodeConfig, command: Command) -> Result<(), XaiError> {
    // Query and maintenance commands run against the data directory with
    // networking disabled.
    let config = NodeConfig { no_network: true, miner_address: None, ..config };
    let node = Node::without_network(config)?;

    match command {
        Command::Start => unreachable!("handled by run_node"),
        Command::Status => {
            println!(
                "{}",
                serde_json::to_string_pretty(&node.status())
                    .map_err(|e| XaiError::Storage(e.to_string()))?
            );
        }
        Command::SubmitTx { hex: tx_hex } => {
            let bytes = hex::decode(tx_hex.trim())
                .map_err(|e| XaiError::Storage(format!("invalid hex: {e}")))?;
            let tx = Transaction::decode(&bytes)?;
            let txid = node.submit_transaction(tx)?;
            println!("{txid}");
        }
        Command::GetBlock { id } => {
            let block = if let Ok(height) = id.parse::<u64>() {
                node.get_block_by_height(height)?
            } else {
                node.get_block_by_hash(&Hash256::from_hex(&id)?)?
            };
            match block {
                Some(block) => println!("{}", hex::encode(block.encode())),
                None => println!("not found"),
            }
        }
        Command::GetTx { txid } => {
            let txid = Hash256::from_hex(&txid)?;
            match node.get_transaction(&txid)? {
                Some((tx, Some(height))) => {
                    println!("confirmed at height {height}: {}", hex::encode(tx.encode()));
                }
                Some((tx, None)) => println!("pending: {}", hex::encode(tx.encode())),
                None => println!("not found"),
            }
        }
        Command::GetUtxo { outpoint } => {
            let (txid, vout) = outpoint
                .rsplit_once(':')
                .ok_or_else(|| XaiError::Storage("expected txid:vout".into()))?;
            let outpoint = OutPoint {
                txid: Hash256::from_hex(txid)?,
                vout: vout
                    .parse()
                    .map_err(|_| XaiError::Storage("invalid vout".into()))?,
            };
            match node.get_utxo(&outpoint)? {
                Some(entry) => println!(
                    "{} µXAI to {} (height {}, coinbase: {})",
                    entry.amount, entry.address, entry.height, entry.coinbase
                ),
                None => println!("not found"),
            }
        }
        Command::Reindex => {
            node.reindex()?;
            println!("reindex complete: height {}", node.status().height);
        }
        Command::ResyncFromCheckpoint => {
            let height = node.resync_from_checkpoint()?;
            println!("resynced to checkpoint at height {height}");
        }
    }
    Ok(())
}

/// Initialize the tracing subscriber; `json` output suits log pipelines.
fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if format == "json" {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
