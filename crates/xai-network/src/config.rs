//! Network service configuration.

/// Configuration for the P2P service of one node.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Interface to listen on.
    pub listen_addr: String,
    /// TCP port; 0 asks the OS for an ephemeral port (tests).
    pub listen_port: u16,
    /// Peers to dial at startup, `host:port`.
    pub bootstrap_peers: Vec<String>,
    /// Upper bound on concurrently connected peers.
    pub max_peers: usize,
    /// Per-peer outbound queue depth; a peer that cannot drain this many
    /// frames is dropped as the slowest consumer.
    pub send_queue_depth: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: xai_core::constants::DEFAULT_P2P_PORT,
            bootstrap_peers: Vec::new(),
            max_peers: 64,
            send_queue_depth: 64,
        }
    }
}

impl NetworkConfig {
    /// The `host:port` string to bind.
    pub fn listen_socket(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}
