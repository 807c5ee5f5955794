use crate::blockchain::{Block, Blockchain, SharedLedger};
use crate::config::Config;
use crate::consensus::{Consensus, ConsensusAlgorithm, ConsensusHandle, ConsensusKind, MiningError};
use crate::discovery::Discovery;
use crate::error::ChainError;
use crate::events::{EventBus, NodeEvent};
use crate::network::{split_node_id, NetworkNode};
use crate::persistence::{JsonFilePersistence, Persistence};
use crate::transaction::Transaction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Degraded,
}

pub struct Node {
    pub config: Config,
    pub persistence: Arc<dyn Persistence>,
    pub blockchain: SharedLedger,
    pub consensus: ConsensusHandle,
    pub network: Arc<NetworkNode>,
    pub events: EventBus,
    pub state: Arc<RwLock<NodeState>>,
    mining_halt: Arc<AtomicBool>,
}

/// Install the fmt subscriber once per process; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
}

impl Node {
    /// Validate `config`, restore the ledger from the configured snapshot
    /// file and bind the P2P listener.
    pub async fn init(config: Config) -> Result<Self, ChainError> {
        init_tracing();
        let persistence: Arc<dyn Persistence> =
            Arc::new(JsonFilePersistence::new(&config.storage.snapshot_path));
        Self::init_with_persistence(config, persistence).await
    }

    pub async fn init_with_persistence(
        config: Config,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self, ChainError> {
        config.validate()?;
        info!(
            "Starting TuCoin node (consensus = {}, p2p port = {})",
            config.consensus.algorithm, config.network.p2p_port
        );

        let blockchain = match persistence.load_blockchain() {
            Ok(chain) => {
                info!("Loaded ledger with {} blocks", chain.len());
                chain
            }
            Err(e) => {
                warn!("Failed to load ledger snapshot: {}. Creating new chain.", e);
                Blockchain::new()
            }
        };

        let blockchain = blockchain.shared();
        let consensus = Consensus::from_config(&config.consensus)?.into_handle();
        let events = EventBus::new(config.network.event_buffer);
        let network = NetworkNode::bind(
            config.network.clone(),
            blockchain.clone(),
            consensus.clone(),
            events.clone(),
        )
        .await?;

        Ok(Self {
            config,
            persistence,
            blockchain,
            consensus,
            network,
            events,
            state: Arc::new(RwLock::new(NodeState::Booting)),
            mining_halt: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start networking, reach the bootstrap peers, run the initial sync and
    /// spawn the autosave and miner loops. Returns once the node is Ready.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChainError> {
        self.set_state(NodeState::Syncing).await;
        self.network.start()?;

        if self.config.discovery.enabled {
            let discovery = Arc::new(Discovery::new(
                Arc::clone(&self.network),
                self.config.discovery.clone(),
            ));
            if let Err(e) = discovery.start().await {
                warn!("Peer discovery unavailable: {}", e);
            }
        }

        let mut reached = 0usize;
        for peer in &self.config.network.bootstrap_peers {
            let Some((host, port)) = split_node_id(peer) else {
                warn!("Ignoring malformed bootstrap peer '{}'", peer);
                continue;
            };
            match self.network.connect_to(host, port).await {
                Ok(node_id) => {
                    info!("Connected to bootstrap peer {}", node_id);
                    reached += 1;
                }
                Err(e) => warn!("Bootstrap peer {} unreachable: {}", peer, e),
            }
        }

        self.network.sync_with_peers().await;

        let state = if !self.config.network.bootstrap_peers.is_empty() && reached == 0 {
            NodeState::Degraded
        } else {
            NodeState::Ready
        };
        self.set_state(state).await;
        info!(
            "Node {} is {:?} (chain height = {})",
            self.network.node_id(),
            state,
            self.blockchain.read().await.len()
        );

        if self.config.storage.autosave_interval_secs > 0 {
            tokio::spawn(Arc::clone(self).autosave_loop());
        }
        if self.config.miner.enabled {
            tokio::spawn(Arc::clone(self).miner_loop());
        }
        Ok(())
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    async fn set_state(&self, state: NodeState) {
        *self.state.write().await = state;
    }

    /// One mining attempt for `miner_address`.
    ///
    /// The template is prepared under the consensus and ledger locks, sealed
    /// on a blocking thread with both released, then committed. If the tip
    /// moved meanwhile the block is discarded. Ineligibility under
    /// proof-of-stake, a discarded block and a halted search all yield
    /// `Ok(None)`. A committed block is gossiped.
    pub async fn mine_once(&self, miner_address: &str) -> Result<Option<Block>, ChainError> {
        let prepared = {
            let engine = self.consensus.read().await;
            let mut chain = self.blockchain.write().await;
            engine.prepare(&mut chain, miner_address)
        };
        let template = match prepared {
            Ok(template) => template,
            Err(e) if e.is_ineligible() => {
                debug!("Not producing a block this round: {}", e);
                return Ok(None);
            }
            Err(MiningError::Chain(e)) => return Err(e),
            Err(e) => return Err(ChainError::InvalidBlock(e.to_string())),
        };

        let sealing = template.clone();
        let halt = Arc::clone(&self.mining_halt);
        let sealed = tokio::task::spawn_blocking(move || sealing.seal_until(&halt))
            .await
            .map_err(|e| ChainError::IoError(format!("Mining task failed: {}", e)))?;

        let mut chain = self.blockchain.write().await;
        let Some(block) = sealed else {
            chain.withdraw_pending(&template.reward);
            debug!("Mining of block #{} halted", template.index);
            return Ok(None);
        };
        if let Err(e) = template.commit(&mut chain, block.clone()) {
            info!(
                "Discarded block #{}: the chain moved while sealing ({})",
                block.index, e
            );
            return Ok(None);
        }
        drop(chain);

        info!("Mined block #{} ({})", block.index, block.hash);
        self.events.emit(NodeEvent::NewBlock(block.clone()));
        let report = self.network.broadcast_block(&block).await;
        debug!(
            "Block #{} delivered to {}/{} peers",
            block.index,
            report.delivered,
            report.attempted()
        );
        Ok(Some(block))
    }

    /// Validate, queue and gossip a transaction built by a wallet.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<u64, ChainError> {
        tx.validate()?;
        let next_index = {
            let mut chain = self.blockchain.write().await;
            if !chain.add_pending(tx.clone()) {
                return Err(ChainError::InvalidTransaction(
                    "Transaction is already pending".to_string(),
                ));
            }
            chain.next_index()
        };
        self.events.emit(NodeEvent::NewTransaction(tx.clone()));
        self.network.broadcast_transaction(&tx).await;
        Ok(next_index)
    }

    /// Replace the active consensus algorithm. Stake tables are not carried over.
    pub async fn switch_consensus(&self, kind: ConsensusKind) {
        let mut consensus = self.consensus.write().await;
        if consensus.kind() == kind {
            return;
        }
        *consensus = Consensus::build(kind, &self.config.consensus);
        info!("Switched consensus to {}", consensus.name());
    }

    pub async fn save(&self) -> Result<(), ChainError> {
        let snapshot = self.blockchain.read().await.export_snapshot();
        self.persistence.save_snapshot(&snapshot)
    }

    /// Stop every loop and any nonce search in flight, then write a final snapshot.
    pub async fn shutdown(&self) -> Result<(), ChainError> {
        self.mining_halt.store(true, Ordering::SeqCst);
        self.network.shutdown();
        self.set_state(NodeState::Degraded).await;
        self.save().await
    }

    async fn autosave_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.storage.autosave_interval_secs);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.network.wait_for_shutdown() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.save().await {
                error!("Autosave failed: {}", e);
            }
        }
    }

    async fn miner_loop(self: Arc<Self>) {
        let address = self.config.miner.address.clone();
        let period = Duration::from_secs(self.config.miner.interval_secs);
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Miner enabled for {}", address);

        loop {
            tokio::select! {
                _ = self.network.wait_for_shutdown() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.mine_once(&address).await {
                warn!("Mining failed: {}", e);
            }
        }
    }
}
