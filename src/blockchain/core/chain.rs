use crate::consensus::ConsensusAlgorithm;
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::state::LedgerSnapshot;
use super::validation::{check_block, check_genesis, validate_chain};

pub const GENESIS_TIMESTAMP: u64 = 1672531200000;
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Ledger shared between the network handlers, the miner and collaborators.
pub type SharedLedger = Arc<RwLock<Blockchain>>;

/// Consensus-specific proof: a nonce for proof-of-work, the validator
/// address for proof-of-stake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Proof {
    Nonce(u64),
    Validator(String),
}

impl Proof {
    pub fn as_nonce(&self) -> Option<u64> {
        match self {
            Proof::Nonce(n) => Some(*n),
            Proof::Validator(_) => None,
        }
    }

    pub fn as_validator(&self) -> Option<&str> {
        match self {
            Proof::Validator(addr) => Some(addr),
            Proof::Nonce(_) => None,
        }
    }
}

/// Canonical block digest.
///
/// The input is compact JSON whose object keys are sorted at every level
/// (serde_json's default `Map` is a `BTreeMap`), so every node hashes the
/// same bytes.
pub fn compute_hash(
    index: u64,
    timestamp: u64,
    transactions: &[Transaction],
    previous_hash: &str,
    proof: &Proof,
) -> String {
    let canonical = serde_json::json!({
        "index": index,
        "timestamp": timestamp,
        "transactions": transactions,
        "previous_hash": previous_hash,
        "proof": proof,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub proof: Proof,
    pub hash: String,
}

impl Block {
    pub fn new(
        index: u64,
        timestamp: u64,
        transactions: Vec<Transaction>,
        previous_hash: String,
        proof: Proof,
    ) -> Self {
        let hash = compute_hash(index, timestamp, &transactions, &previous_hash, &proof);
        Block {
            index,
            timestamp,
            transactions,
            previous_hash,
            proof,
            hash,
        }
    }

    /// The fixed first block shared by every node.
    pub fn genesis() -> Self {
        Block::new(
            0,
            GENESIS_TIMESTAMP,
            Vec::new(),
            GENESIS_PREVIOUS_HASH.to_string(),
            Proof::Nonce(0),
        )
    }

    pub fn calculate_hash(&self) -> String {
        compute_hash(
            self.index,
            self.timestamp,
            &self.transactions,
            &self.previous_hash,
            &self.proof,
        )
    }

    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }
}

/// Replicated chain plus the pending-transaction pool.
#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    mempool: Mempool,
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain {
    /// Create a chain holding only the genesis block.
    pub fn new() -> Self {
        Blockchain {
            blocks: vec![Self::create_genesis_block()],
            mempool: Mempool::new(),
        }
    }

    pub fn create_genesis_block() -> Block {
        Block::genesis()
    }

    pub fn shared(self) -> SharedLedger {
        Arc::new(RwLock::new(self))
    }

    /// Read-only ordered view of the chain.
    pub fn chain(&self) -> &[Block] {
        &self.blocks
    }

    /// Read-only ordered view of the mempool.
    pub fn pending_transactions(&self) -> &[Transaction] {
        self.mempool.transactions()
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Never true: a ledger always holds its genesis block.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last_block(&self) -> &Block {
        // Every constructor seeds the genesis block and nothing removes it.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn next_index(&self) -> u64 {
        self.last_block().index + 1
    }

    /// Queue a transfer without any balance or signature checks.
    /// Returns the index of the block that will include it.
    pub fn add_transaction(&mut self, sender: &str, receiver: &str, amount: f64) -> u64 {
        self.mempool.push(Transaction::new(sender, receiver, amount));
        self.next_index()
    }

    /// Queue an already-built transaction (e.g. one the wallet signed).
    pub fn submit_transaction(&mut self, tx: Transaction) -> u64 {
        self.mempool.push(tx);
        self.next_index()
    }

    /// Queue a transaction unless an identical one is already pending.
    pub fn add_pending(&mut self, tx: Transaction) -> bool {
        self.mempool.insert_unique(tx)
    }

    /// Take one pending copy of `tx` back out of the mempool.
    pub fn withdraw_pending(&mut self, tx: &Transaction) -> bool {
        self.mempool.remove(tx)
    }

    /// Structural check of `block` as the successor of `previous`.
    pub fn is_valid_block(&self, block: &Block, previous: &Block) -> bool {
        check_block(block, previous).is_ok()
    }

    /// Append a block produced locally. Only the structural checks run here;
    /// the producing consensus engine is trusted for its own proof.
    pub fn commit_block(&mut self, block: Block) -> Result<(), ChainError> {
        check_block(&block, self.last_block())?;
        self.mempool.remove_included(&block.transactions);
        self.blocks.push(block);
        Ok(())
    }

    /// Admit a block received from the network. Only the exact next block is
    /// accepted; anything else is reported so the caller can drop it.
    pub fn admit_block(
        &mut self,
        block: Block,
        consensus: &dyn ConsensusAlgorithm,
    ) -> Result<(), ChainError> {
        let expected = self.blocks.len() as u64;
        if block.index > expected {
            return Err(ChainError::OrphanBlock);
        }
        if block.index < expected {
            return Err(ChainError::BlockAlreadyExists);
        }

        let tip = self.last_block();
        check_block(&block, tip)?;
        if !consensus.validate_block(&block, tip) {
            return Err(ChainError::InvalidProof);
        }

        self.mempool.remove_included(&block.transactions);
        self.blocks.push(block);
        Ok(())
    }

    /// Longest-valid-chain fork choice. The swap happens only if `candidate`
    /// is strictly longer and valid from genesis; otherwise nothing changes.
    pub fn replace_chain(
        &mut self,
        candidate: Vec<Block>,
        consensus: &dyn ConsensusAlgorithm,
    ) -> Result<(), ChainError> {
        if candidate.len() <= self.blocks.len() {
            return Err(ChainError::InvalidChain(format!(
                "Candidate length {} is not longer than local length {}",
                candidate.len(),
                self.blocks.len()
            )));
        }

        validate_chain(&candidate, Some(consensus))?;

        for block in &candidate {
            self.mempool.remove_included(&block.transactions);
        }
        info!(
            "Replacing local chain ({} blocks) with candidate ({} blocks)",
            self.blocks.len(),
            candidate.len()
        );
        self.blocks = candidate;
        Ok(())
    }

    pub fn export_snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            chain: self.blocks.clone(),
            pending_transactions: self.mempool.transactions().to_vec(),
        }
    }

    /// Restore chain and mempool from a snapshot after a structural check.
    pub fn import_snapshot(&mut self, snapshot: LedgerSnapshot) -> Result<(), ChainError> {
        let genesis = snapshot
            .chain
            .first()
            .ok_or_else(|| ChainError::InvalidChain("Snapshot holds no blocks".to_string()))?;
        check_genesis(genesis)?;
        validate_chain(&snapshot.chain, None)?;

        self.blocks = snapshot.chain;
        self.mempool = Mempool::from_transactions(snapshot.pending_transactions);
        Ok(())
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, ChainError> {
        let mut chain = Blockchain::new();
        chain.import_snapshot(snapshot)?;
        Ok(chain)
    }
}
