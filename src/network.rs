//! P2P networking for TuCoin
//!
//! Every exchange is one short-lived TCP connection: the caller writes one
//! frame, the handler reads it, dispatches it through
//! [`NetworkNode::process_message`], writes back at most one reply and
//! closes. Gossip opens a fresh connection per peer.
//!
//! Background tasks (accept loop, heartbeat, liveness sweep, periodic sync
//! and the dialer) all stop when [`NetworkNode::shutdown`] is called.

pub mod protocol;

pub use protocol::{is_valid_node_id, Message, ProtocolError, PROTOCOL_VERSION};

use crate::blockchain::{Block, SharedLedger};
use crate::config::NetworkConfig;
use crate::consensus::ConsensusHandle;
use crate::error::ChainError;
use crate::events::{EventBus, EventKind, NodeEvent};
use crate::peers::{PeerRegistry, PeerStatus, Transition};
use crate::sync::{ChainSynchronizer, SyncOutcome};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use protocol::{read_frame, write_frame};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const PEER_TASK_QUEUE: usize = 256;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Split a `host:port` node id.
pub fn split_node_id(node_id: &str) -> Option<(&str, u16)> {
    let (host, port) = node_id.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((host, port))
}

/// Address other nodes can reach us on, found by asking the routing table
/// which interface would be used for an outbound datagram. Nothing is sent.
fn detect_local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Outcome of one gossip fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Peers that could not be reached, with the reason.
    pub failed: Vec<(String, String)>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed.len()
    }
}

/// Background peer work queued from message handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerTask {
    /// Handshake with an address learned from a peer list or a beacon.
    Dial(String),
    /// Ask a freshly introduced peer for its peer list.
    FetchNodes(String),
}

pub struct NetworkNode {
    node_id: String,
    local_addr: SocketAddr,
    config: NetworkConfig,
    ledger: SharedLedger,
    consensus: ConsensusHandle,
    peers: PeerRegistry,
    events: EventBus,
    synchronizer: ChainSynchronizer,
    send_permits: Arc<Semaphore>,
    listener: Mutex<Option<TcpListener>>,
    task_tx: mpsc::Sender<PeerTask>,
    task_rx: Mutex<Option<mpsc::Receiver<PeerTask>>>,
    running: AtomicBool,
    shutdown: Notify,
}

impl NetworkNode {
    /// Bind the listening socket and fix our node id. Port 0 picks an
    /// ephemeral port; the id always carries the port actually bound.
    pub async fn bind(
        config: NetworkConfig,
        ledger: SharedLedger,
        consensus: ConsensusHandle,
        events: EventBus,
    ) -> Result<Arc<Self>, ChainError> {
        let listener = TcpListener::bind((config.bind_host.as_str(), config.p2p_port))
            .await
            .map_err(|e| {
                ChainError::NetworkError(format!(
                    "P2P port {} unavailable on {}: {}",
                    config.p2p_port, config.bind_host, e
                ))
            })?;
        let local_addr = listener.local_addr()?;

        let host = match &config.advertise_host {
            Some(host) => host.clone(),
            None if !local_addr.ip().is_unspecified() => local_addr.ip().to_string(),
            None => detect_local_ip(),
        };
        let node_id = format!("{}:{}", host, local_addr.port());
        info!("P2P listener bound on {} (node id {})", local_addr, node_id);

        let (task_tx, task_rx) = mpsc::channel(PEER_TASK_QUEUE);
        let send_permits = Arc::new(Semaphore::new(config.max_concurrent_sends.max(1)));

        Ok(Arc::new(Self {
            peers: PeerRegistry::new(node_id.clone()),
            synchronizer: ChainSynchronizer::new(events.clone()),
            node_id,
            local_addr,
            config,
            ledger,
            consensus,
            events,
            send_permits,
            listener: Mutex::new(Some(listener)),
            task_tx,
            task_rx: Mutex::new(Some(task_rx)),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }

    /// Spawn the accept loop and the periodic tasks. Calling it twice is an error.
    pub fn start(self: &Arc<Self>) -> Result<(), ChainError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| ChainError::NetworkError("network node already started".to_string()))?;
        let task_rx = self
            .task_rx
            .lock()
            .take()
            .ok_or_else(|| ChainError::NetworkError("network node already started".to_string()))?;

        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(Arc::clone(self).accept_loop(listener));
        tokio::spawn(Arc::clone(self).peer_task_loop(task_rx));
        tokio::spawn(Arc::clone(self).heartbeat_loop());
        tokio::spawn(Arc::clone(self).sweep_loop());
        tokio::spawn(Arc::clone(self).sync_loop());

        info!("Network node {} started", self.node_id);
        Ok(())
    }

    /// Clear the running flag and wake every loop. Idempotent.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Network node {} shutting down", self.node_id);
        }
        self.shutdown.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been requested.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_running() {
            return;
        }
        notified.await;
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn consensus(&self) -> &ConsensusHandle {
        &self.consensus
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn synchronizer(&self) -> &ChainSynchronizer {
        &self.synchronizer
    }

    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe(kind)
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.wait_for_shutdown() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    debug!("Accepted connection from {}", remote);
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.handle_connection(stream, remote).await });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
        debug!("Accept loop for {} stopped", self.node_id);
    }

    /// Read one frame, dispatch it, write back the reply if there is one.
    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, remote: SocketAddr) {
        let io_timeout = self.config.io_timeout();
        let max = self.config.max_message_bytes;

        let message = match tokio::time::timeout(io_timeout, read_frame(&mut stream, max)).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                debug!("Dropping connection from {}: {}", remote, e);
                return;
            }
            Err(_) => {
                debug!("Timed out reading from {}", remote);
                return;
            }
        };
        debug!("Received {} from {}", message.kind(), remote);

        let from = remote.to_string();
        if let Some(reply) = self.process_message(message, &from).await {
            match tokio::time::timeout(io_timeout, write_frame(&mut stream, &reply, max)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to reply {} to {}: {}", reply.kind(), remote, e),
                Err(_) => warn!("Timed out replying {} to {}", reply.kind(), remote),
            }
        }
        let _ = stream.shutdown().await;
    }

    /// Single dispatch point for every decoded message. `from` labels the
    /// sender in logs and events. Returns the reply, if the message has one.
    pub async fn process_message(self: &Arc<Self>, message: Message, from: &str) -> Option<Message> {
        match message {
            Message::Introduce { node_id } => {
                if node_id == self.node_id {
                    debug!("Ignoring introduction from ourselves");
                    return None;
                }
                let transition = self.peers.register(&node_id, now_millis());
                self.handle_transition(&node_id, transition, true);
                if transition == Transition::Discovered {
                    self.queue_task(PeerTask::FetchNodes(node_id.clone()));
                }
                Some(Message::IntroduceAck {
                    node_id: self.node_id.clone(),
                })
            }

            Message::GetNodes => Some(Message::Nodes {
                nodes: self.peers.online_peers(),
            }),

            Message::Nodes { nodes } => {
                for node_id in nodes {
                    self.enqueue_dial(node_id);
                }
                None
            }

            Message::GetChain => {
                let chain = self.ledger.read().await.chain().to_vec();
                Some(Message::chain(chain))
            }

            Message::Chain { chain, .. } => {
                self.synchronizer
                    .reconcile(&self.ledger, &self.consensus, from, chain)
                    .await;
                None
            }

            Message::NewBlock { block } => {
                self.admit_block(block, from).await;
                None
            }

            Message::NewTransaction { transaction } => {
                let added = self.ledger.write().await.add_pending(transaction.clone());
                if added {
                    debug!(
                        "Added transaction {} -> {} ({}) from {}",
                        transaction.sender, transaction.receiver, transaction.amount, from
                    );
                    self.events.emit(NodeEvent::NewTransaction(transaction));
                }
                None
            }

            Message::Heartbeat { node_id, .. } => {
                let transition = self.peers.on_heartbeat(&node_id, now_millis());
                self.handle_transition(&node_id, transition, true);
                // A heartbeat proves liveness, so a first sighting is also an online edge.
                if transition == Transition::Discovered {
                    self.events.emit(NodeEvent::PeerOnline { node_id });
                }
                None
            }

            Message::NodeStatus { node_id, status } => {
                if node_id != self.node_id {
                    let transition = match status {
                        PeerStatus::Offline => self.peers.mark_offline(&node_id),
                        PeerStatus::Online => self.peers.register(&node_id, now_millis()),
                    };
                    self.handle_transition(&node_id, transition, false);
                }
                None
            }

            other @ (Message::IntroduceAck { .. } | Message::NodeAnnouncement { .. }) => {
                debug!("Unexpected {} from {}", other.kind(), from);
                None
            }
        }
    }

    /// Exact-next-block admission. Orphans and duplicates are dropped
    /// quietly; anything failing validation is reported.
    async fn admit_block(&self, block: Block, from: &str) {
        let index = block.index;
        let result = {
            let engine = self.consensus.read().await;
            let mut chain = self.ledger.write().await;
            chain.admit_block(block.clone(), &*engine)
        };

        match result {
            Ok(()) => {
                info!("Admitted block #{} from {}", index, from);
                self.events.emit(NodeEvent::NewBlock(block));
            }
            Err(ChainError::OrphanBlock) | Err(ChainError::BlockAlreadyExists) => {
                debug!("Dropped non-contiguous block #{} from {}", index, from);
            }
            Err(e) => {
                warn!("Rejected block #{} from {}: {}", index, from, e);
                self.events.emit(NodeEvent::BlockRejected {
                    from: from.to_string(),
                    index,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Publish a registry transition and, when `gossip` is set, tell the
    /// other peers about it.
    fn handle_transition(self: &Arc<Self>, node_id: &str, transition: Transition, gossip: bool) {
        let (event, status) = match transition {
            Transition::Discovered => (
                NodeEvent::NewPeer {
                    node_id: node_id.to_string(),
                },
                PeerStatus::Online,
            ),
            Transition::CameOnline => (
                NodeEvent::PeerOnline {
                    node_id: node_id.to_string(),
                },
                PeerStatus::Online,
            ),
            Transition::WentOffline => (
                NodeEvent::PeerOffline {
                    node_id: node_id.to_string(),
                },
                PeerStatus::Offline,
            ),
            Transition::Unchanged => return,
        };
        self.events.emit(event);

        if gossip {
            let node = Arc::clone(self);
            let message = Message::NodeStatus {
                node_id: node_id.to_string(),
                status,
            };
            tokio::spawn(async move {
                node.broadcast_message(message).await;
            });
        }
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// One request/response exchange on a fresh connection.
    pub async fn request(&self, addr: &str, message: &Message) -> Result<Message, ProtocolError> {
        let max = self.config.max_message_bytes;
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await?;
            write_frame(&mut stream, message, max).await?;
            read_frame(&mut stream, max).await
        };

        tokio::time::timeout(self.config.io_timeout(), exchange)
            .await
            .map_err(|_| {
                ProtocolError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} to {} timed out", message.kind(), addr),
                ))
            })?
    }

    /// Handshake with `host:port`, then learn its peers and pull its chain.
    /// Returns the node id the peer acknowledged with.
    pub async fn connect_to(self: &Arc<Self>, host: &str, port: u16) -> Result<String, ChainError> {
        let addr = format!("{}:{}", host, port);
        if addr == self.node_id {
            return Err(ChainError::NetworkError("refusing to connect to ourselves".to_string()));
        }
        if self.peers.is_online(&addr) {
            return Ok(addr);
        }
        let _dial = self
            .peers
            .begin_dial(&addr)
            .ok_or_else(|| ChainError::NetworkError(format!("already dialling {}", addr)))?;

        let introduce = Message::Introduce {
            node_id: self.node_id.clone(),
        };
        let peer_id = match self.request(&addr, &introduce).await? {
            Message::IntroduceAck { node_id } if node_id != self.node_id => node_id,
            Message::IntroduceAck { .. } => {
                return Err(ChainError::NetworkError(format!(
                    "{} acknowledged with our own node id",
                    addr
                )))
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "introduce_ack",
                    got: other.kind(),
                }
                .into())
            }
        };

        let transition = self.peers.register(&peer_id, now_millis());
        self.handle_transition(&peer_id, transition, true);
        info!("Connected to {} ({})", peer_id, addr);

        if let Err(e) = self.fetch_nodes(&addr).await {
            warn!("Peer list exchange with {} failed: {}", addr, e);
        }
        if let Err(e) = self.pull_chain(&addr).await {
            warn!("Chain pull from {} failed: {}", addr, e);
        }
        Ok(peer_id)
    }

    /// Ask `addr` for its peer list and queue dials for the unknown ones.
    pub async fn fetch_nodes(self: &Arc<Self>, addr: &str) -> Result<usize, ChainError> {
        match self.request(addr, &Message::GetNodes).await? {
            Message::Nodes { nodes } => {
                let queued = nodes
                    .into_iter()
                    .filter(|node_id| self.enqueue_dial(node_id.clone()))
                    .count();
                debug!("Queued {} dials from {}'s peer list", queued, addr);
                Ok(queued)
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "nodes",
                got: other.kind(),
            }
            .into()),
        }
    }

    /// Pull the full chain from `addr` and reconcile it with ours.
    pub async fn pull_chain(&self, addr: &str) -> Result<SyncOutcome, ChainError> {
        let reply = match self.request(addr, &Message::GetChain).await {
            Ok(reply) => reply,
            Err(e) => {
                self.synchronizer.record_sync_failure(addr).await;
                return Err(e.into());
            }
        };

        match reply {
            Message::Chain { chain, .. } => Ok(self
                .synchronizer
                .reconcile(&self.ledger, &self.consensus, addr, chain)
                .await),
            other => {
                self.synchronizer.record_sync_failure(addr).await;
                Err(ProtocolError::UnexpectedMessage {
                    expected: "chain",
                    got: other.kind(),
                }
                .into())
            }
        }
    }

    /// Pull from every online peer in turn.
    pub async fn sync_with_peers(&self) -> Vec<(String, Result<SyncOutcome, ChainError>)> {
        let mut results = Vec::new();
        for peer in self.peers.online_peers() {
            let result = self.pull_chain(&peer).await;
            if let Err(e) = &result {
                debug!("Sync with {} failed: {}", peer, e);
            }
            results.push((peer, result));
        }
        results
    }

    /// Gossip to every online peer.
    pub async fn broadcast_message(&self, message: Message) -> BroadcastReport {
        let targets = self.peers.online_peers();
        self.send_to_all(targets, &message).await
    }

    pub async fn broadcast_block(&self, block: &Block) -> BroadcastReport {
        self.broadcast_message(Message::NewBlock {
            block: block.clone(),
        })
        .await
    }

    pub async fn broadcast_transaction(&self, transaction: &Transaction) -> BroadcastReport {
        self.broadcast_message(Message::NewTransaction {
            transaction: transaction.clone(),
        })
        .await
    }

    /// Fire-and-forget fan-out. Sends run concurrently, capped by the send
    /// semaphore; one unreachable peer never blocks the others.
    async fn send_to_all(&self, targets: Vec<String>, message: &Message) -> BroadcastReport {
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let frame = match message.encode_frame(self.config.max_message_bytes) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!("Cannot encode {} for broadcast: {}", message.kind(), e);
                return BroadcastReport {
                    delivered: 0,
                    failed: targets.into_iter().map(|t| (t, e.to_string())).collect(),
                };
            }
        };

        let io_timeout = self.config.io_timeout();
        let mut sends = JoinSet::new();
        for target in targets {
            let permits = Arc::clone(&self.send_permits);
            let frame = Arc::clone(&frame);
            sends.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => send_frame(&target, &frame, io_timeout).await,
                    Err(_) => Err(io::Error::new(io::ErrorKind::Other, "send limiter closed")),
                };
                (target, result)
            });
        }

        let mut report = BroadcastReport::default();
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((target, Err(e))) => {
                    debug!("Failed to send {} to {}: {}", message.kind(), target, e);
                    report.failed.push((target, e.to_string()));
                }
                Err(e) => warn!("Send task failed: {}", e),
            }
        }
        report
    }

    // ── Peer tasks ──────────────────────────────────────────────────────

    /// Queue a handshake with `node_id` unless it is us, already online or
    /// malformed. Returns whether a dial was queued.
    pub fn enqueue_dial(&self, node_id: String) -> bool {
        if node_id == self.node_id || !is_valid_node_id(&node_id) || self.peers.is_online(&node_id) {
            return false;
        }
        self.queue_task(PeerTask::Dial(node_id))
    }

    fn queue_task(&self, task: PeerTask) -> bool {
        match self.task_tx.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                debug!("Peer task queue full, dropping {:?}", task);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn peer_task_loop(self: Arc<Self>, mut tasks: mpsc::Receiver<PeerTask>) {
        loop {
            let task = tokio::select! {
                _ = self.wait_for_shutdown() => break,
                task = tasks.recv() => task,
            };
            let Some(task) = task else { break };

            let node = Arc::clone(&self);
            tokio::spawn(async move { node.run_peer_task(task).await });
        }
    }

    async fn run_peer_task(self: Arc<Self>, task: PeerTask) {
        match task {
            PeerTask::Dial(node_id) => {
                let Some((host, port)) = split_node_id(&node_id) else {
                    return;
                };
                if let Err(e) = self.connect_to(host, port).await {
                    debug!("Dial {} failed: {}", node_id, e);
                }
            }
            PeerTask::FetchNodes(node_id) => {
                if let Err(e) = self.fetch_nodes(&node_id).await {
                    debug!("Peer list request to {} failed: {}", node_id, e);
                }
            }
        }
    }

    // ── Periodic loops ──────────────────────────────────────────────────

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = self.config.heartbeat_interval();
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.wait_for_shutdown() => break,
                _ = ticker.tick() => {}
            }

            let heartbeat = Message::Heartbeat {
                node_id: self.node_id.clone(),
                timestamp: now_millis(),
            };
            let report = self.send_to_all(self.peers.known_peers(), &heartbeat).await;
            if report.attempted() > 0 {
                debug!(
                    "Heartbeat delivered to {}/{} peers",
                    report.delivered,
                    report.attempted()
                );
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let period = self.config.sweep_interval();
        let threshold_ms = self.config.offline_threshold().as_millis() as u64;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.wait_for_shutdown() => break,
                _ = ticker.tick() => {}
            }

            for node_id in self.peers.sweep(now_millis(), threshold_ms) {
                self.handle_transition(&node_id, Transition::WentOffline, true);
            }
        }
    }

    async fn sync_loop(self: Arc<Self>) {
        let period = self.config.sync_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.wait_for_shutdown() => break,
                _ = ticker.tick() => {}
            }
            self.sync_with_peers().await;
        }
    }
}

/// Deliver one pre-encoded frame on a fresh connection, then close it.
async fn send_frame(addr: &str, frame: &[u8], io_timeout: Duration) -> io::Result<()> {
    let send = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(frame).await?;
        stream.flush().await?;
        stream.shutdown().await
    };
    tokio::time::timeout(io_timeout, send)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("send to {} timed out", addr)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Blockchain;
    use crate::consensus::{Consensus, ConsensusAlgorithm, ProofOfWork};

    fn mined(blocks: usize) -> Blockchain {
        let mut pow = ProofOfWork::new(1);
        let mut chain = Blockchain::new();
        for i in 0..blocks {
            chain.submit_transaction(
                Transaction::new("alice", "bob", i as f64).with_signature("sig"),
            );
            pow.mine(&mut chain, "miner").unwrap();
        }
        chain
    }

    async fn node_with(ledger: Blockchain) -> Arc<NetworkNode> {
        NetworkNode::bind(
            NetworkConfig::local(0),
            ledger.shared(),
            Consensus::Work(ProofOfWork::new(1)).into_handle(),
            EventBus::new(16),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_node_id_uses_bound_port() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node_with(Blockchain::new()).await;
            assert_ne!(node.port(), 0);
            assert_eq!(node.node_id(), format!("127.0.0.1:{}", node.port()));
            assert!(!node.is_running());
        })
        .await
        .expect("test_node_id_uses_bound_port timed out");
    }

    #[tokio::test]
    async fn test_longer_chain_message_replaces_genesis_only_chain() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node_with(Blockchain::new()).await;
            let remote = mined(2);

            let reply = node
                .process_message(Message::chain(remote.chain().to_vec()), "127.0.0.1:7000")
                .await;

            assert!(reply.is_none());
            let local = node.ledger().read().await;
            assert_eq!(local.len(), 3);
            assert_eq!(local.chain(), remote.chain());
        })
        .await
        .expect("test_longer_chain_message_replaces_genesis_only_chain timed out");
    }

    #[tokio::test]
    async fn test_non_contiguous_block_dropped() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node_with(mined(2)).await;
            let mut rejected = node.subscribe(EventKind::BlockRejected);
            let far_ahead = mined(5).chain()[5].clone();

            node.process_message(Message::NewBlock { block: far_ahead }, "127.0.0.1:7000")
                .await;

            assert_eq!(node.ledger().read().await.len(), 3);
            assert!(rejected.try_recv().is_err());
        })
        .await
        .expect("test_non_contiguous_block_dropped timed out");
    }

    #[tokio::test]
    async fn test_next_block_admitted_and_invalid_reported() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let source = mined(1);
            let node = node_with(Blockchain::new()).await;
            let mut rejected = node.subscribe(EventKind::BlockRejected);
            let mut admitted = node.subscribe(EventKind::NewBlock);

            let mut forged = source.chain()[1].clone();
            forged.proof = crate::blockchain::Proof::Validator("mallory".into());
            forged.hash = forged.calculate_hash();
            node.process_message(Message::NewBlock { block: forged }, "127.0.0.1:7000")
                .await;
            assert!(matches!(
                rejected.recv().await.unwrap(),
                NodeEvent::BlockRejected { index: 1, .. }
            ));

            let block = source.chain()[1].clone();
            node.process_message(Message::NewBlock { block: block.clone() }, "127.0.0.1:7000")
                .await;
            assert_eq!(admitted.recv().await.unwrap(), NodeEvent::NewBlock(block));
            assert_eq!(node.ledger().read().await.len(), 2);
        })
        .await
        .expect("test_next_block_admitted_and_invalid_reported timed out");
    }

    #[tokio::test]
    async fn test_duplicate_transaction_kept_once() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node_with(Blockchain::new()).await;
            let mut added = node.subscribe(EventKind::NewTransaction);
            let tx = Transaction::new("alice", "bob", 2.5).with_signature("sig");

            for _ in 0..2 {
                node.process_message(
                    Message::NewTransaction { transaction: tx.clone() },
                    "127.0.0.1:7000",
                )
                .await;
            }

            assert_eq!(node.ledger().read().await.pending_transactions(), &[tx.clone()]);
            assert_eq!(added.recv().await.unwrap(), NodeEvent::NewTransaction(tx));
            assert!(added.try_recv().is_err());
        })
        .await
        .expect("test_duplicate_transaction_kept_once timed out");
    }

    #[tokio::test]
    async fn test_introduce_registers_and_acks() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node_with(Blockchain::new()).await;
            let mut new_peer = node.subscribe(EventKind::NewPeer);

            let reply = node
                .process_message(
                    Message::Introduce { node_id: "127.0.0.1:7001".into() },
                    "127.0.0.1:50000",
                )
                .await;

            assert_eq!(
                reply,
                Some(Message::IntroduceAck { node_id: node.node_id().to_string() })
            );
            assert!(node.peers().is_online("127.0.0.1:7001"));
            assert_eq!(
                new_peer.recv().await.unwrap(),
                NodeEvent::NewPeer { node_id: "127.0.0.1:7001".into() }
            );

            let own = Message::Introduce { node_id: node.node_id().to_string() };
            assert!(node.process_message(own, "127.0.0.1:50001").await.is_none());
            assert_eq!(node.peers().len(), 1);
        })
        .await
        .expect("test_introduce_registers_and_acks timed out");
    }

    #[tokio::test]
    async fn test_get_nodes_lists_online_peers() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node_with(Blockchain::new()).await;
            node.peers().register("127.0.0.1:7001", now_millis());
            node.peers().register("127.0.0.1:7002", now_millis());
            node.peers().mark_offline("127.0.0.1:7002");

            let reply = node.process_message(Message::GetNodes, "127.0.0.1:50000").await;
            assert_eq!(
                reply,
                Some(Message::Nodes { nodes: vec!["127.0.0.1:7001".to_string()] })
            );
        })
        .await
        .expect("test_get_nodes_lists_online_peers timed out");
    }

    #[tokio::test]
    async fn test_status_gossip_updates_registry() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node_with(Blockchain::new()).await;
            let mut offline = node.subscribe(EventKind::PeerOffline);
            node.peers().register("127.0.0.1:7001", now_millis());

            node.process_message(
                Message::NodeStatus {
                    node_id: "127.0.0.1:7001".into(),
                    status: PeerStatus::Offline,
                },
                "127.0.0.1:7002",
            )
            .await;

            assert_eq!(node.peers().status("127.0.0.1:7001"), Some(PeerStatus::Offline));
            assert_eq!(
                offline.recv().await.unwrap(),
                NodeEvent::PeerOffline { node_id: "127.0.0.1:7001".into() }
            );

            node.process_message(
                Message::Heartbeat { node_id: "127.0.0.1:7001".into(), timestamp: 0 },
                "127.0.0.1:7001",
            )
            .await;
            assert!(node.peers().is_online("127.0.0.1:7001"));
        })
        .await
        .expect("test_status_gossip_updates_registry timed out");
    }

    /// Accept one connection on `listener` and decode the frame it carries.
    async fn next_frame(listener: &TcpListener) -> Message {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_frame(&mut stream, NetworkConfig::local(0).max_message_bytes)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_from_offline_peer_gossips_online_status() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node_with(Blockchain::new()).await;
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let neighbour = listener.local_addr().unwrap().to_string();
            let mut online = node.subscribe(EventKind::PeerOnline);

            node.peers().register(&neighbour, now_millis());
            node.peers().register("127.0.0.1:7001", now_millis());
            node.peers().mark_offline("127.0.0.1:7001");

            let reply = node
                .process_message(
                    Message::Heartbeat { node_id: "127.0.0.1:7001".into(), timestamp: 0 },
                    "127.0.0.1:7001",
                )
                .await;
            assert!(reply.is_none());
            assert!(node.peers().is_online("127.0.0.1:7001"));
            assert_eq!(
                online.recv().await.unwrap(),
                NodeEvent::PeerOnline { node_id: "127.0.0.1:7001".into() }
            );

            assert_eq!(
                next_frame(&listener).await,
                Message::NodeStatus {
                    node_id: "127.0.0.1:7001".into(),
                    status: PeerStatus::Online,
                }
            );
        })
        .await
        .expect("test_heartbeat_from_offline_peer_gossips_online_status timed out");
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_peer_reports_new_and_online() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node_with(Blockchain::new()).await;
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            node.peers()
                .register(&listener.local_addr().unwrap().to_string(), now_millis());
            let mut new_peer = node.subscribe(EventKind::NewPeer);
            let mut online = node.subscribe(EventKind::PeerOnline);

            node.process_message(
                Message::Heartbeat { node_id: "127.0.0.1:7003".into(), timestamp: 0 },
                "127.0.0.1:7003",
            )
            .await;

            assert_eq!(
                new_peer.recv().await.unwrap(),
                NodeEvent::NewPeer { node_id: "127.0.0.1:7003".into() }
            );
            assert_eq!(
                online.recv().await.unwrap(),
                NodeEvent::PeerOnline { node_id: "127.0.0.1:7003".into() }
            );
            assert_eq!(
                next_frame(&listener).await,
                Message::NodeStatus {
                    node_id: "127.0.0.1:7003".into(),
                    status: PeerStatus::Online,
                }
            );

            // A second heartbeat is not an edge.
            node.process_message(
                Message::Heartbeat { node_id: "127.0.0.1:7003".into(), timestamp: 1 },
                "127.0.0.1:7003",
            )
            .await;
            assert!(online.try_recv().is_err());
        })
        .await
        .expect("test_heartbeat_from_unknown_peer_reports_new_and_online timed out");
    }

    #[tokio::test]
    async fn test_broadcast_reports_unreachable_peers() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node_with(Blockchain::new()).await;
            let live = node_with(Blockchain::new()).await;
            live.start().unwrap();

            // Bind then drop a listener to get a port nobody is serving.
            let dead_port = {
                let vacant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                vacant.local_addr().unwrap().port()
            };
            node.peers().register(live.node_id(), now_millis());
            node.peers().register(&format!("127.0.0.1:{}", dead_port), now_millis());

            let tx = Transaction::new("alice", "bob", 1.0).with_signature("sig");
            let report = node.broadcast_transaction(&tx).await;

            assert_eq!(report.delivered, 1);
            assert_eq!(report.failed.len(), 1);
            live.shutdown();
        })
        .await
        .expect("test_broadcast_reports_unreachable_peers timed out");
    }
}
