//! LAN peer discovery
//!
//! A beacon `{"type":"node_announcement","node_id":..,"port":..}` is broadcast
//! over UDP at a fixed interval. A foreign beacon queues a handshake with the
//! announcer, addressed by the datagram's source IP and the announced port.

use crate::config::DiscoveryConfig;
use crate::error::ChainError;
use crate::network::protocol::MAX_DATAGRAM_BYTES;
use crate::network::{Message, NetworkNode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Discovery {
    node: Arc<NetworkNode>,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(node: Arc<NetworkNode>, config: DiscoveryConfig) -> Self {
        Self { node, config }
    }

    pub fn announcement(&self) -> Message {
        Message::NodeAnnouncement {
            node_id: self.node.node_id().to_string(),
            port: self.node.port(),
        }
    }

    /// Bind the beacon sockets and spawn the send and receive loops. The
    /// receive side is skipped when another process already holds the
    /// discovery port.
    pub async fn start(self: Arc<Self>) -> Result<(), ChainError> {
        let sender = UdpSocket::bind(("0.0.0.0", 0)).await?;
        sender.set_broadcast(true)?;
        tokio::spawn(Arc::clone(&self).beacon_loop(sender));

        match UdpSocket::bind(("0.0.0.0", self.config.port)).await {
            Ok(listener) => {
                info!("Listening for discovery beacons on UDP {}", self.config.port);
                tokio::spawn(Arc::clone(&self).listen_loop(listener));
            }
            Err(e) => warn!(
                "Discovery port {} unavailable ({}); beacons will be sent but not received",
                self.config.port, e
            ),
        }
        Ok(())
    }

    async fn beacon_loop(self: Arc<Self>, socket: UdpSocket) {
        let payload = match self.announcement().encode_datagram() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode discovery beacon: {}", e);
                return;
            }
        };
        let target = (self.config.broadcast_address.as_str(), self.config.port);

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.node.wait_for_shutdown() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = socket.send_to(&payload, target).await {
                debug!("Discovery beacon send failed: {}", e);
            }
        }
    }

    async fn listen_loop(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            let received = tokio::select! {
                _ = self.node.wait_for_shutdown() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, source)) => {
                    self.handle_datagram(&buf[..len], source);
                }
                Err(e) => debug!("Discovery receive failed: {}", e),
            }
        }
    }

    /// Returns the address a handshake was queued for, if any.
    pub fn handle_datagram(&self, bytes: &[u8], source: SocketAddr) -> Option<String> {
        let (node_id, port) = match Message::decode_datagram(bytes) {
            Ok(Message::NodeAnnouncement { node_id, port }) => (node_id, port),
            Ok(_) => return None,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", source, e);
                return None;
            }
        };
        if node_id == self.node.node_id() {
            return None;
        }

        let addr = format!("{}:{}", source.ip(), port);
        if self.node.enqueue_dial(addr.clone()) {
            debug!("Beacon from {} ({}), dialling {}", node_id, source, addr);
            Some(addr)
        } else {
            None
        }
    }
}
