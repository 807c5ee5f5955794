//! Peer registry and liveness tracking
//!
//! Every known peer is keyed by its `host:port` node id. All reads and
//! check-then-act updates happen under one lock, so concurrent handlers
//! never observe a half-applied transition.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerStatus::Online => write!(f, "online"),
            PeerStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub node_id: String,
    /// Local receive time of the last handshake or heartbeat, in milliseconds.
    pub last_seen: u64,
    pub status: PeerStatus,
}

/// Outcome of a registry update, used by the caller to decide what to gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Previously unknown peer, now online.
    Discovered,
    /// Known offline peer, now online again.
    CameOnline,
    WentOffline,
    Unchanged,
}

impl Transition {
    pub fn is_online_edge(self) -> bool {
        matches!(self, Transition::Discovered | Transition::CameOnline)
    }
}

#[derive(Debug, Default)]
struct Inner {
    peers: HashMap<String, PeerEntry>,
    dialing: HashSet<String>,
}

/// Shared peer table. Cloning yields another handle to the same table.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    self_id: String,
    inner: Arc<Mutex<Inner>>,
}

impl PeerRegistry {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Mark `node_id` online after a successful handshake.
    pub fn register(&self, node_id: &str, now: u64) -> Transition {
        let transition = self.touch(node_id, now);
        if transition.is_online_edge() {
            info!("Peer {} registered ({:?})", node_id, transition);
        }
        transition
    }

    /// Record a heartbeat from `node_id`, received locally at `now`.
    pub fn on_heartbeat(&self, node_id: &str, now: u64) -> Transition {
        let transition = self.touch(node_id, now);
        match transition {
            Transition::CameOnline => info!("Peer {} is back online", node_id),
            Transition::Discovered => info!("Peer {} discovered via heartbeat", node_id),
            _ => debug!("Heartbeat from {}", node_id),
        }
        transition
    }

    fn touch(&self, node_id: &str, now: u64) -> Transition {
        if node_id == self.self_id {
            return Transition::Unchanged;
        }

        let mut inner = self.inner.lock();
        match inner.peers.get_mut(node_id) {
            Some(entry) => {
                entry.last_seen = now;
                if entry.status == PeerStatus::Offline {
                    entry.status = PeerStatus::Online;
                    Transition::CameOnline
                } else {
                    Transition::Unchanged
                }
            }
            None => {
                inner.peers.insert(
                    node_id.to_string(),
                    PeerEntry {
                        node_id: node_id.to_string(),
                        last_seen: now,
                        status: PeerStatus::Online,
                    },
                );
                Transition::Discovered
            }
        }
    }

    /// Flip a known online peer to offline. Unknown peers are ignored.
    pub fn mark_offline(&self, node_id: &str) -> Transition {
        let mut inner = self.inner.lock();
        match inner.peers.get_mut(node_id) {
            Some(entry) if entry.status == PeerStatus::Online => {
                entry.status = PeerStatus::Offline;
                info!("Peer {} marked offline", node_id);
                Transition::WentOffline
            }
            _ => Transition::Unchanged,
        }
    }

    /// Mark every online peer silent for longer than `threshold_ms` offline.
    /// Returns the ids that transitioned.
    pub fn sweep(&self, now: u64, threshold_ms: u64) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut expired: Vec<String> = inner
            .peers
            .values_mut()
            .filter(|entry| {
                entry.status == PeerStatus::Online
                    && now.saturating_sub(entry.last_seen) > threshold_ms
            })
            .map(|entry| {
                entry.status = PeerStatus::Offline;
                entry.node_id.clone()
            })
            .collect();
        expired.sort();

        for node_id in &expired {
            info!("Peer {} timed out, marked offline", node_id);
        }
        expired
    }

    pub fn status(&self, node_id: &str) -> Option<PeerStatus> {
        self.inner.lock().peers.get(node_id).map(|entry| entry.status)
    }

    pub fn is_known(&self, node_id: &str) -> bool {
        self.inner.lock().peers.contains_key(node_id)
    }

    pub fn is_online(&self, node_id: &str) -> bool {
        self.status(node_id) == Some(PeerStatus::Online)
    }

    /// Gossip targets, in stable order.
    pub fn online_peers(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut online: Vec<String> = inner
            .peers
            .values()
            .filter(|entry| entry.status == PeerStatus::Online)
            .map(|entry| entry.node_id.clone())
            .collect();
        online.sort();
        online
    }

    /// Every known peer regardless of status. Heartbeats go to all of them so
    /// an offline peer can come back on its next receipt.
    pub fn known_peers(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut known: Vec<String> = inner.peers.keys().cloned().collect();
        known.sort();
        known
    }

    pub fn entries(&self) -> Vec<PeerEntry> {
        let inner = self.inner.lock();
        let mut entries: Vec<PeerEntry> = inner.peers.values().cloned().collect();
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().peers.is_empty()
    }

    /// Claim `addr` for an outbound handshake. Refuses our own id, peers that
    /// are already online and addresses another task is dialling. The claim
    /// is released when the guard drops.
    pub fn begin_dial(&self, addr: &str) -> Option<DialGuard> {
        if addr == self.self_id {
            return None;
        }

        let mut inner = self.inner.lock();
        let online = inner
            .peers
            .get(addr)
            .map_or(false, |entry| entry.status == PeerStatus::Online);
        if online || !inner.dialing.insert(addr.to_string()) {
            return None;
        }

        Some(DialGuard {
            addr: addr.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn is_dialing(&self, addr: &str) -> bool {
        self.inner.lock().dialing.contains(addr)
    }
}

#[derive(Debug)]
pub struct DialGuard {
    addr: String,
    inner: Arc<Mutex<Inner>>,
}

impl DialGuard {
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        self.inner.lock().dialing.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF_ID: &str = "10.0.0.1:5000";

    #[test]
    fn test_register_transitions() {
        let registry = PeerRegistry::new(SELF_ID);

        assert_eq!(registry.register("10.0.0.2:5000", 1_000), Transition::Discovered);
        assert_eq!(registry.register("10.0.0.2:5000", 2_000), Transition::Unchanged);
        assert_eq!(registry.status("10.0.0.2:5000"), Some(PeerStatus::Online));

        assert_eq!(registry.register(SELF_ID, 1_000), Transition::Unchanged);
        assert!(!registry.is_known(SELF_ID));
    }

    #[test]
    fn test_sweep_threshold_is_strict() {
        let registry = PeerRegistry::new(SELF_ID);
        registry.register("a:1", 0);
        registry.register("b:1", 50);

        assert!(registry.sweep(100, 100).is_empty());
        assert_eq!(registry.sweep(101, 100), vec!["a:1".to_string()]);
        assert_eq!(registry.status("a:1"), Some(PeerStatus::Offline));
        assert_eq!(registry.status("b:1"), Some(PeerStatus::Online));

        // Already offline peers are not reported again.
        assert_eq!(registry.sweep(500, 100), vec!["b:1".to_string()]);
    }

    #[test]
    fn test_next_heartbeat_restores_online() {
        let registry = PeerRegistry::new(SELF_ID);
        registry.register("a:1", 0);
        registry.sweep(1_000, 100);
        assert!(!registry.is_online("a:1"));

        assert_eq!(registry.on_heartbeat("a:1", 1_001), Transition::CameOnline);
        assert!(registry.is_online("a:1"));
        assert_eq!(registry.entries()[0].last_seen, 1_001);
    }

    #[test]
    fn test_offline_peers_stay_known_but_leave_gossip_set() {
        let registry = PeerRegistry::new(SELF_ID);
        registry.register("b:1", 0);
        registry.register("a:1", 0);
        assert_eq!(registry.online_peers(), vec!["a:1".to_string(), "b:1".to_string()]);

        assert_eq!(registry.mark_offline("a:1"), Transition::WentOffline);
        assert_eq!(registry.mark_offline("a:1"), Transition::Unchanged);
        assert_eq!(registry.mark_offline("zz:1"), Transition::Unchanged);

        assert_eq!(registry.online_peers(), vec!["b:1".to_string()]);
        assert_eq!(registry.known_peers(), vec!["a:1".to_string(), "b:1".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_dial_guard_is_exclusive_and_released_on_drop() {
        let registry = PeerRegistry::new(SELF_ID);
        assert!(registry.begin_dial(SELF_ID).is_none());

        let guard = registry.begin_dial("a:1").unwrap();
        assert_eq!(guard.addr(), "a:1");
        assert!(registry.begin_dial("a:1").is_none());
        assert!(registry.is_dialing("a:1"));

        drop(guard);
        assert!(!registry.is_dialing("a:1"));

        registry.register("a:1", 0);
        assert!(registry.begin_dial("a:1").is_none());
        registry.mark_offline("a:1");
        assert!(registry.begin_dial("a:1").is_some());
    }

    #[test]
    fn test_concurrent_registration_is_atomic() {
        let registry = PeerRegistry::new(SELF_ID);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register("a:1", 10))
            })
            .collect();

        let discovered = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|t| *t == Transition::Discovered)
            .count();
        assert_eq!(discovered, 1);
    }
}
