//! TuCoin - A peer-to-peer ledger with pluggable proof-of-work and proof-of-stake consensus
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Ledger
//! - [`blockchain`] - Blocks, chain validation and snapshots
//! - [`transaction`] - Transaction types and shape checks
//! - [`mempool`] - Pending transaction pool
//!
//! ## Consensus
//! - [`consensus`] - Proof-of-work and stake-weighted block production
//!
//! ## Networking
//! - [`peers`] - Peer registry and liveness
//! - [`network`] - Wire protocol, dispatch, gossip and heartbeats
//! - [`discovery`] - LAN beacon discovery
//! - [`sync`] - Longest-valid-chain reconciliation
//! - [`events`] - Typed node events
//!
//! ## Node
//! - [`node`] - Orchestration of the above
//! - [`persistence`] - Ledger snapshots on disk
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Ledger
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus
// ============================================================================
pub mod consensus;

// ============================================================================
// Networking
// ============================================================================
pub mod discovery;
pub mod events;
pub mod network;
pub mod peers;
pub mod sync;

// ============================================================================
// Node & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod node;
pub mod persistence;
