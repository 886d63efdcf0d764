//! TCP transport for the XAI P2P protocol.
//!
//! The service owns a listener task and one task per peer connection. Every
//! frame carries a [`SignedEnvelope`]; the read path verifies the signature,
//! replay window, rate limits, and ban state before a message surfaces as a
//! [`NetworkEvent`]. Peers are identified by the pubkey fingerprint of their
//! envelopes, not by their socket address.
//!
//! Outbound frames go through bounded per-peer queues; a peer that cannot
//! drain its queue is dropped as the slowest consumer. Commands arrive on an
//! mpsc channel and events leave on a broadcast channel, so the node wires
//! the two without the service ever holding chain handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use xai_core::codec::Encodable;
use xai_core::crypto::KeyPair;
use xai_core::difficulty::ChainWork;
use xai_core::error::{NetworkError, XaiError};
use xai_core::params::NetworkParams;
use xai_core::types::Hash256;

use crate::config::NetworkConfig;
use crate::envelope::{ReplayGuard, SignedEnvelope};
use crate::peers::{PeerId, PeerRegistry};
use crate::protocol::{self, FRAME_HEADER_BYTES, Message};
use crate::rate_limiter::RateLimiter;

/// Instructions from the node to the network service.
#[derive(Clone, Debug)]
pub enum NetworkCommand {
    /// Connect out to `host:port`.
    Dial(String),
    /// Send a message to one connected peer.
    SendTo(PeerId, Message),
    /// Gossip a message to up to `peer_fanout` random peers.
    Broadcast { message: Message, exclude: Option<PeerId> },
    /// Drop a peer's connection.
    Disconnect(PeerId),
}

/// Notifications from the network service to the node.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
    /// A peer finished its handshake (first valid envelope seen).
    PeerConnected { peer: PeerId, endpoint: String },
    /// A peer's connection closed.
    PeerDisconnected { peer: PeerId },
    /// A verified message arrived.
    MessageReceived { peer: PeerId, message: Message },
}

/// Tip summary advertised in our `hello`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TipInfo {
    pub hash: Hash256,
    pub height: u64,
    pub work: ChainWork,
}

struct PeerHandle {
    sender: mpsc::Sender<Vec<u8>>,
}

struct Inner {
    params: NetworkParams,
    config: NetworkConfig,
    keypair: KeyPair,
    registry: Arc<PeerRegistry>,
    replay: Mutex<ReplayGuard>,
    limiter: Mutex<RateLimiter>,
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
    events: broadcast::Sender<NetworkEvent>,
    envelope_nonce: AtomicU64,
    tip: RwLock<TipInfo>,
}

impl Inner {
    fn now_unix() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
    }

    fn max_frame_bytes(&self) -> usize {
        self.params.max_block_bytes + 4096
    }

    /// Seal a message into a framed envelope.
    fn seal_frame(&self, message: &Message) -> Result<Vec<u8>, NetworkError> {
        message.validate()?;
        let nonce = self.envelope_nonce.fetch_add(1, Ordering::Relaxed);
        let envelope =
            SignedEnvelope::seal(&self.keypair, nonce, Self::now_unix(), message.encode());
        protocol::encode_frame(self.params.magic, &envelope.encode(), self.max_frame_bytes())
    }

    fn hello(&self) -> Message {
        let tip = *self.tip.read();
        Message::Hello {
            version: 1,
            network_id: self.params.network.id(),
            best_tip_hash: tip.hash,
            best_tip_height: tip.height,
            cumulative_work: tip.work,
        }
    }

    /// Verify one inbound envelope end to end. Returns the sender and the
    /// decoded message, or the error that should cost them reputation.
    fn admit_envelope(
        &self,
        envelope: &SignedEnvelope,
        frame_len: usize,
    ) -> Result<(PeerId, Message), NetworkError> {
        envelope.verify()?;
        let peer = envelope.sender_fingerprint();
        let now = Self::now_unix();

        if self.registry.is_banned(&peer, now) {
            return Err(NetworkError::PeerBanned);
        }
        self.replay.lock().check_and_record(envelope, now)?;
        if !self.limiter.lock().admit(&peer, frame_len, Instant::now()) {
            return Err(NetworkError::RateLimited);
        }

        let message = Message::decode(&envelope.payload).map_err(NetworkError::Codec)?;
        message.validate()?;

        // A hello from the wrong network is a different chain talking.
        if let Message::Hello { network_id, .. } = &message {
            if *network_id != self.params.network.id() {
                return Err(NetworkError::BadMagic);
            }
        }

        Ok((peer, message))
    }
}

/// Handle to a running network service.
pub struct NetworkService {
    inner: Arc<Inner>,
    commands: mpsc::Sender<NetworkCommand>,
    local_addr: std::net::SocketAddr,
}

impl NetworkService {
    /// Bind the listener and start the service tasks.
    ///
    /// Returns the service handle and the event stream. The caller keeps the
    /// command sender via [`NetworkService::commands`].
    pub async fn start(
        config: NetworkConfig,
        params: NetworkParams,
        keypair: KeyPair,
    ) -> Result<(Self, broadcast::Receiver<NetworkEvent>), XaiError> {
        let listener = TcpListener::bind(config.listen_socket())
            .await
            .map_err(|e| XaiError::Network(NetworkError::PeerDisconnected(e.to_string())))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| XaiError::Network(NetworkError::PeerDisconnected(e.to_string())))?;

        let (events, events_rx) = broadcast::channel(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let inner = Arc::new(Inner {
            registry: Arc::new(PeerRegistry::new(params.ban_threshold, params.ban_duration_s)),
            replay: Mutex::new(ReplayGuard::new(params.nonce_ttl_s, params.replay_cache_max)),
            limiter: Mutex::new(RateLimiter::new(params.max_msg_rate, params.max_bw_in)),
            peers: Mutex::new(HashMap::new()),
            events,
            envelope_nonce: AtomicU64::new(Self::nonce_seed()),
            tip: RwLock::new(TipInfo::default()),
            config: config.clone(),
            params,
            keypair,
        });

        info!(%local_addr, "network: listening");
        tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        tokio::spawn(command_loop(Arc::clone(&inner), cmd_rx));

        for addr in &config.bootstrap_peers {
            let _ = cmd_tx.send(NetworkCommand::Dial(addr.clone())).await;
        }

        Ok((Self { inner, commands: cmd_tx, local_addr }, events_rx))
    }

    /// Seed the envelope nonce from the clock so restarts never reuse
    /// `(key, nonce)` pairs inside the replay window.
    fn nonce_seed() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
    }

    /// Channel for sending commands to the service.
    pub fn commands(&self) -> mpsc::Sender<NetworkCommand> {
        self.commands.clone()
    }

    /// Subscribe a fresh event receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// The peer registry, shared with the node for reputation decisions.
    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.inner.registry)
    }

    /// Advertise a new tip in future `hello` exchanges.
    pub fn set_tip(&self, tip: TipInfo) {
        *self.inner.tip.write() = tip;
    }

    /// Number of connected (identified) peers.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if inner.peers.lock().len() >= inner.config.max_peers {
                    debug!(%addr, "network: at capacity, refusing inbound");
                    continue;
                }
                tokio::spawn(run_peer(Arc::clone(&inner), stream, addr.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "network: accept failed");
            }
        }
    }
}

async fn command_loop(inner: Arc<Inner>, mut commands: mpsc::Receiver<NetworkCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            NetworkCommand::Dial(addr) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    match TcpStream::connect(&addr).await {
                        Ok(stream) => run_peer(inner, stream, addr).await,
                        Err(e) => debug!(%addr, error = %e, "network: dial failed"),
                    }
                });
            }
            NetworkCommand::SendTo(peer, message) => {
                send_to(&inner, &peer, &message);
            }
            NetworkCommand::Broadcast { message, exclude } => {
                let now = Inner::now_unix();
                let fanout =
                    inner.registry.random_peers(inner.params.peer_fanout, exclude.as_ref(), now);
                for peer in fanout {
                    send_to(&inner, &peer, &message);
                }
            }
            NetworkCommand::Disconnect(peer) => {
                // Dropping the handle closes the writer side; the peer task
                // notices and winds down.
                inner.peers.lock().remove(&peer);
            }
        }
    }
}

fn send_to(inner: &Arc<Inner>, peer: &PeerId, message: &Message) {
    let frame = match inner.seal_frame(message) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%peer, error = %e, "network: refusing to send oversized message");
            return;
        }
    };
    let mut peers = inner.peers.lock();
    if let Some(handle) = peers.get(peer) {
        if handle.sender.try_send(frame).is_err() {
            // Queue full: this peer is the slowest consumer. Drop it.
            warn!(%peer, "network: send queue full, dropping peer");
            peers.remove(peer);
        }
    }
}

/// Drive one peer connection until it closes or misbehaves.
async fn run_peer(inner: Arc<Inner>, stream: TcpStream, endpoint: String) {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(inner.config.send_queue_depth);

    // Introduce ourselves before anything else.
    if let Ok(frame) = inner.seal_frame(&inner.hello()) {
        if writer.write_all(&frame).await.is_err() {
            return;
        }
    }

    // Writer half.
    let write_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    // Reader half: identify the peer from its first valid envelope.
    let mut peer_id: Option<PeerId> = None;
    loop {
        let mut header = [0u8; FRAME_HEADER_BYTES];
        if reader.read_exact(&mut header).await.is_err() {
            break;
        }
        let len = match protocol::decode_frame_header(
            &header,
            inner.params.magic,
            inner.max_frame_bytes(),
        ) {
            Ok(len) => len,
            Err(e) => {
                debug!(%endpoint, error = %e, "network: bad frame header");
                break;
            }
        };
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }

        let envelope = match SignedEnvelope::decode(&payload) {
            Ok(env) => env,
            Err(e) => {
                debug!(%endpoint, error = %e, "network: undecodable envelope");
                break;
            }
        };

        match inner.admit_envelope(&envelope, FRAME_HEADER_BYTES + len) {
            Ok((peer, message)) => {
                let now = Inner::now_unix();
                if peer_id.is_none() {
                    peer_id = Some(peer);
                    inner.registry.register(envelope.sender_pubkey, &endpoint, now);
                    inner
                        .peers
                        .lock()
                        .insert(peer, PeerHandle { sender: out_tx.clone() });
                    let _ = inner
                        .events
                        .send(NetworkEvent::PeerConnected { peer, endpoint: endpoint.clone() });
                }
                inner.registry.touch(&peer, len, now);
                let _ = inner.events.send(NetworkEvent::MessageReceived { peer, message });
            }
            Err(e) => {
                let peer = envelope.sender_fingerprint();
                let banned = inner.registry.debit(&peer, e.kind(), Inner::now_unix());
                debug!(%peer, error = %e, banned, "network: envelope rejected");
                if matches!(e, NetworkError::PeerBanned) || banned {
                    break;
                }
                // Rate-limited or replayed frames are dropped silently; the
                // connection survives.
            }
        }

        // Commanded disconnects remove the handle; notice and wind down.
        if let Some(id) = peer_id {
            if !inner.peers.lock().contains_key(&id) {
                break;
            }
        }
    }

    write_task.abort();
    if let Some(peer) = peer_id {
        inner.peers.lock().remove(&peer);
        inner.limiter.lock().remove_peer(&peer);
        let _ = inner.events.send(NetworkEvent::PeerDisconnected { peer });
        debug!(%peer, %endpoint, "network: peer disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            listen_addr: "127.0.0.1".into(),
            listen_port: 0,
            bootstrap_peers: Vec::new(),
            max_peers: 8,
            send_queue_depth: 16,
        }
    }

    fn params() -> NetworkParams {
        NetworkParams::regtest()
    }

    async fn start_node(seed: u8) -> (NetworkService, broadcast::Receiver<NetworkEvent>) {
        let keypair = KeyPair::from_secret_bytes(&[seed; 32]).unwrap();
        NetworkService::start(test_config(), params(), keypair).await.unwrap()
    }

    async fn expect_event<F: Fn(&NetworkEvent) -> bool>(
        rx: &mut broadcast::Receiver<NetworkEvent>,
        what: &str,
        pred: F,
    ) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("event stream open");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    #[tokio::test]
    async fn dial_exchanges_hellos_and_connects_both_sides() {
        let (a, mut a_rx) = start_node(0x11).await;
        let (b, mut b_rx) = start_node(0x12).await;

        a.commands()
            .send(NetworkCommand::Dial(b.local_addr().to_string()))
            .await
            .unwrap();

        expect_event(&mut a_rx, "A sees B", |e| {
            matches!(e, NetworkEvent::PeerConnected { .. })
        })
        .await;
        expect_event(&mut b_rx, "B sees A", |e| {
            matches!(e, NetworkEvent::PeerConnected { .. })
        })
        .await;

        // Both sides got each other's hello on the regtest network.
        let hello = expect_event(&mut b_rx, "B receives hello", |e| {
            matches!(e, NetworkEvent::MessageReceived { message: Message::Hello { .. }, .. })
        })
        .await;
        if let NetworkEvent::MessageReceived { message: Message::Hello { network_id, .. }, .. } =
            hello
        {
            assert_eq!(network_id, params().network.id());
        }
        assert_eq!(a.peer_count(), 1);
        assert_eq!(b.peer_count(), 1);
    }

    #[tokio::test]
    async fn ping_pong_round_trip() {
        let (a, mut a_rx) = start_node(0x21).await;
        let (b, mut b_rx) = start_node(0x22).await;

        a.commands()
            .send(NetworkCommand::Dial(b.local_addr().to_string()))
            .await
            .unwrap();

        // Learn each other's ids from the connect events.
        let a_sees_b = expect_event(&mut a_rx, "A connect", |e| {
            matches!(e, NetworkEvent::PeerConnected { .. })
        })
        .await;
        let NetworkEvent::PeerConnected { peer: b_id, .. } = a_sees_b else { unreachable!() };
        let b_sees_a = expect_event(&mut b_rx, "B connect", |e| {
            matches!(e, NetworkEvent::PeerConnected { .. })
        })
        .await;
        let NetworkEvent::PeerConnected { peer: a_id, .. } = b_sees_a else { unreachable!() };

        a.commands().send(NetworkCommand::SendTo(b_id, Message::Ping(77))).await.unwrap();
        let ping = expect_event(&mut b_rx, "B gets ping", |e| {
            matches!(e, NetworkEvent::MessageReceived { message: Message::Ping(77), .. })
        })
        .await;
        let NetworkEvent::MessageReceived { peer, .. } = ping else { unreachable!() };
        assert_eq!(peer, a_id);

        b.commands().send(NetworkCommand::SendTo(a_id, Message::Pong(77))).await.unwrap();
        expect_event(&mut a_rx, "A gets pong", |e| {
            matches!(e, NetworkEvent::MessageReceived { message: Message::Pong(77), .. })
        })
        .await;
    }

    #[tokio::test]
    async fn hello_advertises_current_tip() {
        let (a, _a_rx) = start_node(0x31).await;
        let (b, mut b_rx) = start_node(0x32).await;

        a.set_tip(TipInfo { hash: Hash256([9; 32]), height: 42, work: ChainWork([1; 32]) });
        a.commands()
            .send(NetworkCommand::Dial(b.local_addr().to_string()))
            .await
            .unwrap();

        let hello = expect_event(&mut b_rx, "tip hello", |e| {
            matches!(e, NetworkEvent::MessageReceived { message: Message::Hello { .. }, .. })
        })
        .await;
        let NetworkEvent::MessageReceived {
            message: Message::Hello { best_tip_height, best_tip_hash, .. },
            ..
        } = hello
        else {
            unreachable!()
        };
        assert_eq!(best_tip_height, 42);
        assert_eq!(best_tip_hash, Hash256([9; 32]));
    }
}
