//! Typed node events
//!
//! Each [`EventKind`] owns its own broadcast channel, so a subscriber only
//! receives the kind it asked for. Emitting with no subscribers is a no-op.

use crate::blockchain::Block;
use crate::transaction::Transaction;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewTransaction,
    NewBlock,
    NewPeer,
    PeerOffline,
    PeerOnline,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    BlockRejected,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::NewTransaction,
        EventKind::NewBlock,
        EventKind::NewPeer,
        EventKind::PeerOffline,
        EventKind::PeerOnline,
        EventKind::SyncStarted,
        EventKind::SyncCompleted,
        EventKind::SyncFailed,
        EventKind::BlockRejected,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    NewTransaction(Transaction),
    NewBlock(Block),
    NewPeer { node_id: String },
    PeerOffline { node_id: String },
    PeerOnline { node_id: String },
    SyncStarted {
        peer: String,
        local_height: usize,
        target_height: usize,
    },
    SyncCompleted {
        peer: String,
        height: usize,
        blocks_synced: usize,
    },
    SyncFailed {
        peer: String,
        reason: String,
        local_height: usize,
    },
    BlockRejected { from: String, index: u64, reason: String },
}

impl NodeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NodeEvent::NewTransaction(_) => EventKind::NewTransaction,
            NodeEvent::NewBlock(_) => EventKind::NewBlock,
            NodeEvent::NewPeer { .. } => EventKind::NewPeer,
            NodeEvent::PeerOffline { .. } => EventKind::PeerOffline,
            NodeEvent::PeerOnline { .. } => EventKind::PeerOnline,
            NodeEvent::SyncStarted { .. } => EventKind::SyncStarted,
            NodeEvent::SyncCompleted { .. } => EventKind::SyncCompleted,
            NodeEvent::SyncFailed { .. } => EventKind::SyncFailed,
            NodeEvent::BlockRejected { .. } => EventKind::BlockRejected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    channels: Arc<HashMap<EventKind, broadcast::Sender<NodeEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// `capacity` bounds how far a slow subscriber may lag before it starts
    /// missing events of that kind.
    pub fn new(capacity: usize) -> Self {
        let channels = EventKind::ALL
            .iter()
            .map(|kind| (*kind, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self {
            channels: Arc::new(channels),
        }
    }

    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<NodeEvent> {
        match self.channels.get(&kind) {
            Some(sender) => sender.subscribe(),
            // Every kind is created up front.
            None => broadcast::channel(1).1,
        }
    }

    /// Returns the number of subscribers that will see the event.
    pub fn emit(&self, event: NodeEvent) -> usize {
        self.channels
            .get(&event.kind())
            .and_then(|sender| sender.send(event).ok())
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.channels
            .get(&kind)
            .map_or(0, |sender| sender.receiver_count())
    }
}
