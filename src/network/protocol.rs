//! Wire protocol
//!
//! Point-to-point frames are length-prefixed JSON:
//!
//! ```text
//! [1 byte: version = 1] [4 bytes: payload length (u32-be)] [N bytes: UTF-8 JSON]
//! ```
//!
//! The JSON payload is a message object tagged by `"type"`. The header is
//! checked (version, declared length) before any payload byte is read.
//! Discovery beacons travel as bare JSON datagrams with the same tagging.

use crate::blockchain::Block;
use crate::error::ChainError;
use crate::peers::PeerStatus;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u8 = 1;
pub const FRAME_HEADER_LEN: usize = 5;
/// Up-front payload allocation; larger frames grow as their bytes arrive.
const INITIAL_PAYLOAD_CAPACITY: usize = 64 * 1024;
/// Largest discovery datagram we accept.
pub const MAX_DATAGRAM_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0} (expected {PROTOCOL_VERSION})")]
    UnsupportedVersion(u8),

    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    InvalidShape(String),

    #[error("unexpected {got} message, expected {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for ChainError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => ChainError::NetworkError(e.to_string()),
            other => ChainError::ProtocolError(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Introduce { node_id: String },
    IntroduceAck { node_id: String },
    GetNodes,
    Nodes { nodes: Vec<String> },
    GetChain,
    Chain { chain: Vec<Block>, length: usize },
    NewBlock { block: Block },
    NewTransaction { transaction: Transaction },
    Heartbeat { node_id: String, timestamp: u64 },
    NodeStatus { node_id: String, status: PeerStatus },
    NodeAnnouncement { node_id: String, port: u16 },
}

/// `host:port` with a non-empty host and a non-zero port.
pub fn is_valid_node_id(node_id: &str) -> bool {
    match node_id.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().map_or(false, |p| p != 0),
        None => false,
    }
}

fn check_node_id(node_id: &str) -> Result<(), ProtocolError> {
    if is_valid_node_id(node_id) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidShape(format!(
            "node id '{}' is not host:port",
            node_id
        )))
    }
}

impl Message {
    /// Build a `chain` reply; `length` always matches the carried blocks.
    pub fn chain(chain: Vec<Block>) -> Self {
        let length = chain.len();
        Message::Chain { chain, length }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Introduce { .. } => "introduce",
            Message::IntroduceAck { .. } => "introduce_ack",
            Message::GetNodes => "get_nodes",
            Message::Nodes { .. } => "nodes",
            Message::GetChain => "get_chain",
            Message::Chain { .. } => "chain",
            Message::NewBlock { .. } => "new_block",
            Message::NewTransaction { .. } => "new_transaction",
            Message::Heartbeat { .. } => "heartbeat",
            Message::NodeStatus { .. } => "node_status",
            Message::NodeAnnouncement { .. } => "node_announcement",
        }
    }

    /// Whether the sender waits for a reply on the same connection.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Message::Introduce { .. } | Message::GetNodes | Message::GetChain
        )
    }

    /// Shape checks that serde alone cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Message::Introduce { node_id }
            | Message::IntroduceAck { node_id }
            | Message::Heartbeat { node_id, .. }
            | Message::NodeStatus { node_id, .. } => check_node_id(node_id),
            Message::NodeAnnouncement { node_id, port } => {
                check_node_id(node_id)?;
                if *port == 0 {
                    return Err(ProtocolError::InvalidShape(
                        "announcement port must be non-zero".to_string(),
                    ));
                }
                Ok(())
            }
            Message::Nodes { nodes } => nodes.iter().try_for_each(|n| check_node_id(n)),
            Message::Chain { chain, length } => {
                if chain.is_empty() {
                    return Err(ProtocolError::InvalidShape("chain is empty".to_string()));
                }
                if chain.len() != *length {
                    return Err(ProtocolError::InvalidShape(format!(
                        "chain length field {} does not match {} blocks",
                        length,
                        chain.len()
                    )));
                }
                Ok(())
            }
            Message::NewTransaction { transaction } => transaction
                .validate()
                .map_err(|e| ProtocolError::InvalidShape(e.to_string())),
            Message::GetNodes | Message::GetChain | Message::NewBlock { .. } => Ok(()),
        }
    }

    pub fn encode_frame(&self, max_size: usize) -> Result<Vec<u8>, ProtocolError> {
        let payload = serde_json::to_vec(self)?;
        if payload.len() > max_size || payload.len() > u32::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: max_size,
            });
        }
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Validate a frame header and return the payload length it declares.
    pub fn parse_header(
        header: &[u8; FRAME_HEADER_LEN],
        max_size: usize,
    ) -> Result<usize, ProtocolError> {
        if header[0] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header[0]));
        }
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > max_size {
            return Err(ProtocolError::FrameTooLarge { size: len, max: max_size });
        }
        Ok(len)
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let message: Message = serde_json::from_slice(payload)?;
        message.validate()?;
        Ok(message)
    }

    pub fn encode_datagram(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Only `node_announcement` is accepted on the discovery transport.
    pub fn decode_datagram(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let message = Self::decode_payload(bytes)?;
        match message {
            Message::NodeAnnouncement { .. } => Ok(message),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "node_announcement",
                got: other.kind(),
            }),
        }
    }
}

pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = Message::parse_header(&header, max_size)?;

    // The buffer grows with the bytes that actually arrive, not with the
    // length a peer declares.
    let mut payload = Vec::with_capacity(len.min(INITIAL_PAYLOAD_CAPACITY));
    let received = (&mut *reader).take(len as u64).read_to_end(&mut payload).await?;
    if received < len {
        return Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("frame truncated after {} of {} bytes", received, len),
        )));
    }
    Message::decode_payload(&payload)
}

pub async fn write_frame<W>(
    writer: &mut W,
    message: &Message,
    max_size: usize,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode_frame(max_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    #[test]
    fn test_json_shape_uses_type_tag() {
        let json = serde_json::to_value(Message::Heartbeat {
            node_id: "10.0.0.1:5000".into(),
            timestamp: 7,
        })
        .unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["node_id"], "10.0.0.1:5000");

        let json = serde_json::to_value(Message::GetChain).unwrap();
        assert_eq!(json, serde_json::json!({"type": "get_chain"}));

        let json = serde_json::to_value(Message::NodeStatus {
            node_id: "10.0.0.1:5000".into(),
            status: PeerStatus::Offline,
        })
        .unwrap();
        assert_eq!(json["status"], "offline");
    }

    #[tokio::test]
    async fn test_frame_over_stream() {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let msg = Message::chain(vec![Block::genesis()]);
            let (mut client, mut server) = tokio::io::duplex(64 * 1024);

            write_frame(&mut client, &msg, MAX).await.unwrap();
            let received = read_frame(&mut server, MAX).await.unwrap();
            assert_eq!(received, msg);
        })
        .await
        .expect("test_frame_over_stream timed out");
    }

    #[tokio::test]
    async fn test_large_frame_read_in_pieces() {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let msg = Message::Nodes {
                nodes: (0..8_000).map(|i| format!("10.0.{}.{}:5000", i / 256, i % 256)).collect(),
            };
            let frame = msg.encode_frame(MAX).unwrap();
            assert!(frame.len() > INITIAL_PAYLOAD_CAPACITY);

            let (mut client, mut server) = tokio::io::duplex(4 * 1024);
            let writer = tokio::spawn(async move { client.write_all(&frame).await });

            assert_eq!(read_frame(&mut server, MAX).await.unwrap(), msg);
            writer.await.unwrap().unwrap();
        })
        .await
        .expect("test_large_frame_read_in_pieces timed out");
    }

    #[tokio::test]
    async fn test_declared_length_without_payload_fails() {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let (mut client, mut server) = tokio::io::duplex(1024);
            let mut header = vec![PROTOCOL_VERSION];
            header.extend_from_slice(&(MAX as u32).to_be_bytes());
            client.write_all(&header).await.unwrap();
            client.write_all(b"{\"type\"").await.unwrap();
            drop(client);

            match read_frame(&mut server, MAX).await {
                Err(ProtocolError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
                other => panic!("Expected truncated frame error, got {:?}", other),
            }
        })
        .await
        .expect("test_declared_length_without_payload_fails timed out");
    }

    #[test]
    fn test_header_rejects_other_version() {
        let mut frame = Message::GetNodes.encode_frame(MAX).unwrap();
        frame[0] = 2;
        let header: [u8; FRAME_HEADER_LEN] = frame[..FRAME_HEADER_LEN].try_into().unwrap();
        assert!(matches!(
            Message::parse_header(&header, MAX),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_oversized_frames_rejected_both_ways() {
        let msg = Message::Nodes {
            nodes: vec!["10.0.0.1:5000".to_string(); 100],
        };
        assert!(matches!(
            msg.encode_frame(64),
            Err(ProtocolError::FrameTooLarge { max: 64, .. })
        ));

        let mut header = [PROTOCOL_VERSION, 0, 0, 0, 0];
        header[1..].copy_from_slice(&(MAX as u32 + 1).to_be_bytes());
        assert!(matches!(
            Message::parse_header(&header, MAX),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            Message::decode_payload(b"{\"type\":\"get_chain\""),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Message::decode_payload(b"{\"type\":\"launch_missiles\"}"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_chain_length_must_match() {
        let msg = Message::Chain {
            chain: vec![Block::genesis()],
            length: 3,
        };
        let payload = serde_json::to_vec(&msg).unwrap();
        assert!(matches!(
            Message::decode_payload(&payload),
            Err(ProtocolError::InvalidShape(_))
        ));
        assert!(Message::chain(Vec::new()).validate().is_err());
    }

    #[test]
    fn test_node_id_shape() {
        assert!(is_valid_node_id("192.168.1.4:5000"));
        assert!(is_valid_node_id("node.local:5001"));
        assert!(!is_valid_node_id("192.168.1.4"));
        assert!(!is_valid_node_id(":5000"));
        assert!(!is_valid_node_id("host:0"));
        assert!(!is_valid_node_id("host:http"));

        let msg = Message::Introduce { node_id: "nonsense".into() };
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_unsigned_transaction_gossip_rejected() {
        let msg = Message::NewTransaction {
            transaction: Transaction::new("alice", "bob", 1.0),
        };
        assert!(msg.validate().is_err());

        let msg = Message::NewTransaction {
            transaction: Transaction::new("alice", "bob", 1.0).with_signature("sig"),
        };
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_datagram_only_carries_announcements() {
        let beacon = Message::NodeAnnouncement {
            node_id: "10.0.0.1:5000".into(),
            port: 5000,
        };
        let bytes = beacon.encode_datagram().unwrap();
        assert_eq!(Message::decode_datagram(&bytes).unwrap(), beacon);

        let bytes = Message::GetNodes.encode_datagram().unwrap();
        assert!(matches!(
            Message::decode_datagram(&bytes),
            Err(ProtocolError::UnexpectedMessage { .. })
        ));
    }
}
