//! Chain synchronization for TuCoin
//!
//! The network layer pulls full chains from peers; [`ChainSynchronizer`]
//! decides what to do with them. It applies the longest-valid-chain rule
//! against the shared ledger, keeps per-peer bookkeeping and publishes the
//! sync lifecycle events.

use crate::blockchain::{Block, SharedLedger};
use crate::consensus::ConsensusHandle;
use crate::events::{EventBus, NodeEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Consecutive failures after which a peer is reported as unreliable.
const UNRELIABLE_AFTER: u32 = 3;

/// Peer sync information
#[derive(Debug, Clone)]
pub struct PeerSyncInfo {
    pub node_id: String,
    /// Length of the last chain this peer offered.
    pub height: usize,
    pub last_seen: Instant,
    pub chains_adopted: u64,
    pub sync_failures: u32,
}

impl PeerSyncInfo {
    pub fn new(node_id: &str, height: usize) -> Self {
        Self {
            node_id: node_id.to_string(),
            height,
            last_seen: Instant::now(),
            chains_adopted: 0,
            sync_failures: 0,
        }
    }

    pub fn is_unreliable(&self) -> bool {
        self.sync_failures >= UNRELIABLE_AFTER
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub chains_received: u64,
    pub chains_adopted: u64,
    pub blocks_synced: u64,
    pub failures: u64,
    pub last_adopted: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Adopted {
        previous_height: usize,
        height: usize,
    },
    /// The candidate was not longer than the local chain.
    UpToDate { local_height: usize },
    Rejected { reason: String },
}

pub struct ChainSynchronizer {
    peers: Arc<RwLock<HashMap<String, PeerSyncInfo>>>,
    sync_state: Arc<RwLock<SyncState>>,
    stats: Arc<RwLock<SyncStats>>,
    events: EventBus,
}

impl ChainSynchronizer {
    pub fn new(events: EventBus) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            sync_state: Arc::new(RwLock::new(SyncState::Idle)),
            stats: Arc::new(RwLock::new(SyncStats::default())),
            events,
        }
    }

    /// Apply a chain received from `peer`. Adoption happens only when the
    /// candidate is strictly longer and valid from genesis under the active
    /// consensus engine; otherwise the ledger is left untouched.
    pub async fn reconcile(
        &self,
        ledger: &SharedLedger,
        consensus: &ConsensusHandle,
        peer: &str,
        candidate: Vec<Block>,
    ) -> SyncOutcome {
        let target_height = candidate.len();
        self.observe_peer(peer, target_height).await;

        let (local_height, result) = {
            let engine = consensus.read().await;
            let mut chain = ledger.write().await;
            let local_height = chain.len();
            if target_height <= local_height {
                debug!(
                    "Chain from {} ({} blocks) is not longer than ours ({})",
                    peer, target_height, local_height
                );
                return SyncOutcome::UpToDate { local_height };
            }

            self.set_sync_state(SyncState::Syncing).await;
            self.events.emit(NodeEvent::SyncStarted {
                peer: peer.to_string(),
                local_height,
                target_height,
            });
            (local_height, chain.replace_chain(candidate, &*engine))
        };

        match result {
            Ok(()) => {
                info!(
                    "Adopted chain from {}: {} -> {} blocks",
                    peer, local_height, target_height
                );
                self.record_adopted(peer, target_height - local_height).await;
                self.set_sync_state(SyncState::Synced).await;
                self.events.emit(NodeEvent::SyncCompleted {
                    peer: peer.to_string(),
                    height: target_height,
                    blocks_synced: target_height - local_height,
                });
                SyncOutcome::Adopted {
                    previous_height: local_height,
                    height: target_height,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Rejected chain from {}: {}", peer, reason);
                self.record_sync_failure(peer).await;
                self.set_sync_state(SyncState::Failed).await;
                self.events.emit(NodeEvent::SyncFailed {
                    peer: peer.to_string(),
                    reason: reason.clone(),
                    local_height,
                });
                SyncOutcome::Rejected { reason }
            }
        }
    }

    async fn observe_peer(&self, peer: &str, height: usize) {
        let mut peers = self.peers.write().await;
        let info = peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerSyncInfo::new(peer, height));
        info.height = height;
        info.last_seen = Instant::now();

        self.stats.write().await.chains_received += 1;
    }

    async fn record_adopted(&self, peer: &str, blocks: usize) {
        if let Some(info) = self.peers.write().await.get_mut(peer) {
            info.chains_adopted += 1;
            info.sync_failures = 0;
        }

        let mut stats = self.stats.write().await;
        stats.chains_adopted += 1;
        stats.blocks_synced += blocks as u64;
        stats.last_adopted = Some(Instant::now());
    }

    /// Count a failed pull or a rejected chain against `peer`.
    pub async fn record_sync_failure(&self, peer: &str) {
        {
            let mut peers = self.peers.write().await;
            let info = peers
                .entry(peer.to_string())
                .or_insert_with(|| PeerSyncInfo::new(peer, 0));
            info.sync_failures = info.sync_failures.saturating_add(1);
            if info.is_unreliable() {
                warn!(
                    "Peer {} has failed {} consecutive syncs",
                    peer, info.sync_failures
                );
            }
        }
        self.stats.write().await.failures += 1;
    }

    /// Compare `local_height` with the longest chain any peer has offered.
    pub async fn check_sync_health(&self, local_height: usize) -> SyncState {
        let peers = self.peers.read().await;
        match peers.values().map(|p| p.height).max() {
            None => SyncState::Idle,
            Some(best) if local_height >= best => SyncState::Synced,
            Some(best) => {
                debug!("Local chain is {} blocks behind best peer", best - local_height);
                SyncState::Syncing
            }
        }
    }

    pub async fn get_sync_state(&self) -> SyncState {
        *self.sync_state.read().await
    }

    pub async fn is_syncing(&self) -> bool {
        *self.sync_state.read().await == SyncState::Syncing
    }

    async fn set_sync_state(&self, state: SyncState) {
        *self.sync_state.write().await = state;
    }

    pub async fn get_stats(&self) -> SyncStats {
        self.stats.read().await.clone()
    }

    pub async fn get_peer_info(&self, peer: &str) -> Option<PeerSyncInfo> {
        self.peers.read().await.get(peer).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Blockchain;
    use crate::consensus::{Consensus, ConsensusAlgorithm, ProofOfWork};
    use crate::events::EventKind;
    use std::time::Duration;

    fn mined(blocks: usize) -> Blockchain {
        let mut pow = ProofOfWork::new(1);
        let mut chain = Blockchain::new();
        for _ in 0..blocks {
            pow.mine(&mut chain, "miner").unwrap();
        }
        chain
    }

    fn fixtures() -> (SharedLedger, ConsensusHandle, EventBus) {
        (
            Blockchain::new().shared(),
            Consensus::Work(ProofOfWork::new(1)).into_handle(),
            EventBus::new(16),
        )
    }

    #[tokio::test]
    async fn test_longer_chain_adopted() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (ledger, consensus, events) = fixtures();
            let mut started = events.subscribe(EventKind::SyncStarted);
            let mut completed = events.subscribe(EventKind::SyncCompleted);
            let sync = ChainSynchronizer::new(events);

            let remote = mined(2);
            let outcome = sync
                .reconcile(&ledger, &consensus, "10.0.0.2:5000", remote.chain().to_vec())
                .await;

            assert_eq!(outcome, SyncOutcome::Adopted { previous_height: 1, height: 3 });
            assert_eq!(ledger.read().await.chain(), remote.chain());
            assert_eq!(sync.get_sync_state().await, SyncState::Synced);
            assert!(matches!(
                started.recv().await.unwrap(),
                NodeEvent::SyncStarted { local_height: 1, target_height: 3, .. }
            ));
            assert!(matches!(
                completed.recv().await.unwrap(),
                NodeEvent::SyncCompleted { height: 3, blocks_synced: 2, .. }
            ));
        })
        .await
        .expect("test_longer_chain_adopted timed out");
    }

    #[tokio::test]
    async fn test_equal_chain_is_up_to_date() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (ledger, consensus, events) = fixtures();
            let mut started = events.subscribe(EventKind::SyncStarted);
            let sync = ChainSynchronizer::new(events);

            let outcome = sync
                .reconcile(&ledger, &consensus, "10.0.0.2:5000", vec![Block::genesis()])
                .await;

            assert_eq!(outcome, SyncOutcome::UpToDate { local_height: 1 });
            assert!(started.try_recv().is_err());
            assert_eq!(sync.get_sync_state().await, SyncState::Idle);
        })
        .await
        .expect("test_equal_chain_is_up_to_date timed out");
    }

    #[tokio::test]
    async fn test_tampered_chain_rejected() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (ledger, consensus, events) = fixtures();
            let mut failed = events.subscribe(EventKind::SyncFailed);
            let sync = ChainSynchronizer::new(events);

            let mut candidate = mined(3).chain().to_vec();
            candidate[2].hash = "0".repeat(64);

            let outcome = sync
                .reconcile(&ledger, &consensus, "10.0.0.2:5000", candidate)
                .await;

            assert!(matches!(outcome, SyncOutcome::Rejected { .. }));
            assert_eq!(ledger.read().await.len(), 1);
            assert_eq!(sync.get_sync_state().await, SyncState::Failed);
            assert!(matches!(
                failed.recv().await.unwrap(),
                NodeEvent::SyncFailed { local_height: 1, .. }
            ));
        })
        .await
        .expect("test_tampered_chain_rejected timed out");
    }

    #[tokio::test]
    async fn test_peer_failure_tracking() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let sync = ChainSynchronizer::new(EventBus::new(4));
            for _ in 0..3 {
                sync.record_sync_failure("10.0.0.3:5000").await;
            }

            let info = sync.get_peer_info("10.0.0.3:5000").await.unwrap();
            assert!(info.is_unreliable());
            assert_eq!(sync.get_stats().await.failures, 3);
        })
        .await
        .expect("test_peer_failure_tracking timed out");
    }

    #[tokio::test]
    async fn test_sync_health() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (ledger, consensus, events) = fixtures();
            let sync = ChainSynchronizer::new(events);
            assert_eq!(sync.check_sync_health(1).await, SyncState::Idle);

            let remote = mined(2);
            sync.reconcile(&ledger, &consensus, "a:1", remote.chain().to_vec())
                .await;
            assert_eq!(sync.peer_count().await, 1);
            assert_eq!(sync.check_sync_health(1).await, SyncState::Syncing);
            assert_eq!(sync.check_sync_health(3).await, SyncState::Synced);
        })
        .await
        .expect("test_sync_health timed out");
    }
}
