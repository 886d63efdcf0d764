//! # xai-consensus
//! Chain management, fork choice, mining, and checkpoints.

pub mod chain;
pub mod checkpoint;
pub mod miner;

pub use chain::{BlockOutcome, ChainEvent, ChainManager, SyncState};
