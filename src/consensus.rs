//! Pluggable block-admission rules
//!
//! [`ConsensusAlgorithm`] is the seam the ledger and the network validate
//! against. [`Consensus`] is the concrete, runtime-swappable handle the node
//! owns; it is built from the configured variant tag by [`Consensus::from_config`].

pub mod pos;
pub mod pow;

pub use pos::ProofOfStake;
pub use pow::ProofOfWork;

use crate::blockchain::{Block, Blockchain, Proof};
use crate::config::ConsensusConfig;
use crate::error::ChainError;
use crate::transaction::Transaction;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Reward paid to the miner of a proof-of-work block.
pub const POW_BLOCK_REWARD: f64 = 100.0;
/// Reward paid to the validator of a proof-of-stake block.
pub const POS_BLOCK_REWARD: f64 = 10.0;

pub type ConsensusHandle = Arc<RwLock<Consensus>>;

/// Reasons a mining attempt did not produce a block.
#[derive(Debug, Error)]
pub enum MiningError {
    #[error("address {address} has stake {stake}, below the minimum of {min_stake}")]
    InsufficientStake {
        address: String,
        stake: f64,
        min_stake: f64,
    },

    #[error("address {address} was not selected as validator (selected: {selected})")]
    NotSelectedValidator { address: String, selected: String },

    #[error("no address holds the minimum stake")]
    NoEligibleValidator,

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl MiningError {
    /// Ineligibility is expected under proof-of-stake; callers back off and retry.
    pub fn is_ineligible(&self) -> bool {
        matches!(
            self,
            MiningError::InsufficientStake { .. }
                | MiningError::NotSelectedValidator { .. }
                | MiningError::NoEligibleValidator
        )
    }
}

pub trait ConsensusAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    fn difficulty(&self) -> u32;

    fn set_difficulty(&mut self, difficulty: u32);

    /// Check eligibility, queue the reward and capture the tip and mempool
    /// for `miner_address`. This is the only step that needs the ledger.
    fn prepare(&self, ledger: &mut Blockchain, miner_address: &str) -> Result<BlockTemplate, MiningError>;

    /// Produce the next block for `miner_address`, commit it to `ledger` and
    /// return it. Pending transactions consumed by the block leave the mempool.
    fn mine(&mut self, ledger: &mut Blockchain, miner_address: &str) -> Result<Block, MiningError> {
        let template = self.prepare(ledger, miner_address)?;
        let block = template.seal();
        template.commit(ledger, block.clone())?;
        Ok(block)
    }

    /// Check `block` as the successor of `previous` under this engine's rule.
    fn validate_block(&self, block: &Block, previous: &Block) -> bool;

    /// Check `block` as the next block on top of `ledger`.
    fn validate_next(&self, block: &Block, ledger: &Blockchain) -> bool {
        self.validate_block(block, ledger.last_block())
    }
}

/// How a template gets its proof once the ledger is released.
#[derive(Debug, Clone, PartialEq)]
pub enum Sealer {
    Work(ProofOfWork),
    Stake { validator: String },
}

/// A block under construction, detached from the ledger it was taken from.
///
/// Mining is split in three: [`ConsensusAlgorithm::prepare`] under the
/// locks, [`seal`](Self::seal) without them, then [`commit`](Self::commit)
/// under the ledger lock again. A tip that moved in between makes the commit
/// fail and the reward is withdrawn.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTemplate {
    pub index: u64,
    pub timestamp: u64,
    pub previous_hash: String,
    pub transactions: Vec<Transaction>,
    /// Reward queued by `prepare`.
    pub reward: Transaction,
    pub sealer: Sealer,
}

impl BlockTemplate {
    /// Queue `reward` on `ledger` and capture its tip and pending transactions.
    pub fn from_ledger(ledger: &mut Blockchain, reward: Transaction, sealer: Sealer) -> Self {
        ledger.submit_transaction(reward.clone());
        let tip = ledger.last_block();
        Self {
            index: tip.index + 1,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            previous_hash: tip.hash.clone(),
            transactions: ledger.pending_transactions().to_vec(),
            reward,
            sealer,
        }
    }

    /// Finish the block. Under proof-of-work this runs the nonce search, so
    /// call it without holding any lock.
    pub fn seal(&self) -> Block {
        let never = AtomicBool::new(false);
        loop {
            if let Some(block) = self.seal_until(&never) {
                return block;
            }
        }
    }

    /// Finish the block unless `halt` is raised first.
    pub fn seal_until(&self, halt: &AtomicBool) -> Option<Block> {
        match &self.sealer {
            Sealer::Work(pow) => {
                let (nonce, hash) = pow.search_nonce_until(
                    self.index,
                    self.timestamp,
                    &self.transactions,
                    &self.previous_hash,
                    halt,
                )?;
                Some(Block {
                    index: self.index,
                    timestamp: self.timestamp,
                    transactions: self.transactions.clone(),
                    previous_hash: self.previous_hash.clone(),
                    proof: Proof::Nonce(nonce),
                    hash,
                })
            }
            Sealer::Stake { validator } => Some(Block::new(
                self.index,
                self.timestamp,
                self.transactions.clone(),
                self.previous_hash.clone(),
                Proof::Validator(validator.clone()),
            )),
        }
    }

    /// Append `block` to `ledger`. When the tip has moved since `prepare`,
    /// the block is refused and the reward leaves the mempool.
    pub fn commit(&self, ledger: &mut Blockchain, block: Block) -> Result<(), ChainError> {
        if let Err(e) = ledger.commit_block(block) {
            ledger.withdraw_pending(&self.reward);
            return Err(e);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusKind {
    ProofOfWork,
    ProofOfStake,
}

impl FromStr for ConsensusKind {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pow" => Ok(ConsensusKind::ProofOfWork),
            "pos" => Ok(ConsensusKind::ProofOfStake),
            other => Err(ChainError::ConfigError(format!(
                "Unknown consensus algorithm '{}', expected 'pow' or 'pos'",
                other
            ))),
        }
    }
}

impl fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConsensusKind::ProofOfWork => write!(f, "pow"),
            ConsensusKind::ProofOfStake => write!(f, "pos"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Consensus {
    Work(ProofOfWork),
    Stake(ProofOfStake),
}

impl Consensus {
    pub fn build(kind: ConsensusKind, config: &ConsensusConfig) -> Self {
        match kind {
            ConsensusKind::ProofOfWork => Consensus::Work(ProofOfWork::new(config.difficulty)),
            ConsensusKind::ProofOfStake => Consensus::Stake(ProofOfStake::new(config.min_stake)),
        }
    }

    pub fn from_config(config: &ConsensusConfig) -> Result<Self, ChainError> {
        let kind: ConsensusKind = config.algorithm.parse()?;
        Ok(Self::build(kind, config))
    }

    pub fn kind(&self) -> ConsensusKind {
        match self {
            Consensus::Work(_) => ConsensusKind::ProofOfWork,
            Consensus::Stake(_) => ConsensusKind::ProofOfStake,
        }
    }

    pub fn as_stake(&self) -> Option<&ProofOfStake> {
        match self {
            Consensus::Stake(pos) => Some(pos),
            Consensus::Work(_) => None,
        }
    }

    pub fn as_stake_mut(&mut self) -> Option<&mut ProofOfStake> {
        match self {
            Consensus::Stake(pos) => Some(pos),
            Consensus::Work(_) => None,
        }
    }

    pub fn into_handle(self) -> ConsensusHandle {
        Arc::new(RwLock::new(self))
    }

    fn engine(&self) -> &dyn ConsensusAlgorithm {
        match self {
            Consensus::Work(pow) => pow,
            Consensus::Stake(pos) => pos,
        }
    }

    fn engine_mut(&mut self) -> &mut dyn ConsensusAlgorithm {
        match self {
            Consensus::Work(pow) => pow,
            Consensus::Stake(pos) => pos,
        }
    }
}

impl ConsensusAlgorithm for Consensus {
    fn name(&self) -> &'static str {
        self.engine().name()
    }

    fn difficulty(&self) -> u32 {
        self.engine().difficulty()
    }

    fn set_difficulty(&mut self, difficulty: u32) {
        self.engine_mut().set_difficulty(difficulty)
    }

    fn prepare(&self, ledger: &mut Blockchain, miner_address: &str) -> Result<BlockTemplate, MiningError> {
        self.engine().prepare(ledger, miner_address)
    }

    fn mine(&mut self, ledger: &mut Blockchain, miner_address: &str) -> Result<Block, MiningError> {
        self.engine_mut().mine(ledger, miner_address)
    }

    fn validate_block(&self, block: &Block, previous: &Block) -> bool {
        self.engine().validate_block(block, previous)
    }
}
