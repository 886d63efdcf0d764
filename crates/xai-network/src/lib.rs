//! # xai-network
//! Peer-to-peer replication: signed request envelopes, peer registry and
//! reputation, token-bucket rate limits, gossip, and chain sync.

pub mod config;
pub mod envelope;
pub mod peers;
pub mod protocol;
pub mod rate_limiter;
pub mod service;
pub mod sync;

pub use config::NetworkConfig;
pub use envelope::{ReplayGuard, SignedEnvelope};
pub use peers::{PeerId, PeerRegistry, TrustState};
pub use protocol::Message;
pub use rate_limiter::RateLimiter;
pub use service::{NetworkCommand, NetworkEvent, NetworkService};
pub use sync::{SyncAction, SyncEngine, SyncPhase};
