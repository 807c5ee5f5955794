//! Proof-of-work: a block is admitted when its hash starts with
//! `difficulty` zero hex characters.

use super::{BlockTemplate, ConsensusAlgorithm, MiningError, Sealer, POW_BLOCK_REWARD};
use crate::blockchain::{compute_hash, Block, Blockchain, Proof};
use crate::transaction::Transaction;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub const DEFAULT_DIFFICULTY: u32 = 4;
/// A SHA-256 hex digest has 64 characters; no hash meets a longer prefix.
pub const MAX_DIFFICULTY: u32 = 64;
pub const HALT_POLL_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofOfWork {
    difficulty: u32,
    target: String,
}

impl Default for ProofOfWork {
    fn default() -> Self {
        Self::new(DEFAULT_DIFFICULTY)
    }
}

impl ProofOfWork {
    /// Difficulties above [`MAX_DIFFICULTY`] are clamped to it.
    pub fn new(difficulty: u32) -> Self {
        let difficulty = difficulty.min(MAX_DIFFICULTY);
        Self {
            difficulty,
            target: "0".repeat(difficulty as usize),
        }
    }

    /// Required hash prefix.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn meets_target(&self, hash: &str) -> bool {
        hash.starts_with(&self.target)
    }

    /// Sequential nonce search. Unbounded: it returns only once a hash with
    /// the target prefix is found.
    pub fn search_nonce(
        &self,
        index: u64,
        timestamp: u64,
        transactions: &[Transaction],
        previous_hash: &str,
    ) -> (u64, String) {
        let never = AtomicBool::new(false);
        loop {
            if let Some(found) =
                self.search_nonce_until(index, timestamp, transactions, previous_hash, &never)
            {
                return found;
            }
        }
    }

    /// Like [`search_nonce`](Self::search_nonce), but gives up with `None`
    /// once `halt` is set. The flag is polled every [`HALT_POLL_INTERVAL`] nonces.
    pub fn search_nonce_until(
        &self,
        index: u64,
        timestamp: u64,
        transactions: &[Transaction],
        previous_hash: &str,
        halt: &AtomicBool,
    ) -> Option<(u64, String)> {
        let mut nonce = 0u64;
        loop {
            if nonce % HALT_POLL_INTERVAL == 0 && halt.load(Ordering::Relaxed) {
                return None;
            }
            let proof = Proof::Nonce(nonce);
            let hash = compute_hash(index, timestamp, transactions, previous_hash, &proof);
            if self.meets_target(&hash) {
                return Some((nonce, hash));
            }
            nonce = nonce.wrapping_add(1);
        }
    }
}

impl ConsensusAlgorithm for ProofOfWork {
    fn name(&self) -> &'static str {
        "Proof of Work"
    }

    fn difficulty(&self) -> u32 {
        self.difficulty
    }

    fn set_difficulty(&mut self, difficulty: u32) {
        if difficulty > MAX_DIFFICULTY {
            warn!(
                "Difficulty {} exceeds the hash length, using {}",
                difficulty, MAX_DIFFICULTY
            );
        }
        *self = ProofOfWork::new(difficulty);
    }

    fn prepare(&self, ledger: &mut Blockchain, miner_address: &str) -> Result<BlockTemplate, MiningError> {
        let reward = Transaction::reward(miner_address, POW_BLOCK_REWARD);
        let template = BlockTemplate::from_ledger(ledger, reward, Sealer::Work(self.clone()));
        debug!(
            "Mining block {} with {} transactions at difficulty {}",
            template.index,
            template.transactions.len(),
            self.difficulty
        );
        Ok(template)
    }

    fn validate_block(&self, block: &Block, previous: &Block) -> bool {
        block.index == previous.index + 1
            && block.previous_hash == previous.hash
            && block.proof.as_nonce().is_some()
            && block.has_valid_hash()
            && self.meets_target(&block.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mined_block_meets_target() {
        let mut pow = ProofOfWork::new(3);
        let mut ledger = Blockchain::new();
        let block = pow.mine(&mut ledger, "miner").unwrap();

        assert!(block.hash.starts_with("000"));
        assert!(block.has_valid_hash());
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.last_block(), &block);
    }

    #[test]
    fn test_mine_pays_reward_and_clears_mempool() {
        let mut pow = ProofOfWork::new(2);
        let mut ledger = Blockchain::new();
        let transfer = Transaction::new("alice", "bob", 4.0).with_signature("sig");
        ledger.submit_transaction(transfer.clone());

        let block = pow.mine(&mut ledger, "miner").unwrap();

        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[0], transfer);
        let reward = &block.transactions[1];
        assert!(reward.is_system());
        assert_eq!(reward.receiver, "miner");
        assert_eq!(reward.amount, POW_BLOCK_REWARD);
        assert!(ledger.pending_transactions().is_empty());
    }

    #[test]
    fn test_altered_proof_fails_validation() {
        let mut pow = ProofOfWork::new(2);
        let mut ledger = Blockchain::new();
        let block = pow.mine(&mut ledger, "miner").unwrap();
        let genesis = &ledger.chain()[0];
        assert!(pow.validate_block(&block, genesis));

        let mut altered = block.clone();
        let nonce = altered.proof.as_nonce().unwrap();
        altered.proof = Proof::Nonce(nonce + 1);
        assert!(!pow.validate_block(&altered, genesis));
    }

    #[test]
    fn test_validator_proof_is_not_work() {
        let pow = ProofOfWork::new(0);
        let genesis = Block::genesis();
        let block = Block::new(
            1,
            1,
            Vec::new(),
            genesis.hash.clone(),
            Proof::Validator("alice".into()),
        );
        assert!(!pow.validate_block(&block, &genesis));
    }

    #[test]
    fn test_set_difficulty_updates_target() {
        let mut pow = ProofOfWork::default();
        assert_eq!(pow.target(), "0000");
        pow.set_difficulty(2);
        assert_eq!(pow.difficulty(), 2);
        assert_eq!(pow.target(), "00");
    }

    #[test]
    fn test_raised_halt_stops_search() {
        let pow = ProofOfWork::new(MAX_DIFFICULTY);
        let halt = AtomicBool::new(true);
        assert_eq!(pow.search_nonce_until(1, 1, &[], "0", &halt), None);
    }

    #[test]
    fn test_difficulty_is_capped_at_hash_length() {
        assert_eq!(ProofOfWork::new(65).difficulty(), MAX_DIFFICULTY);

        let mut pow = ProofOfWork::new(1);
        pow.set_difficulty(200);
        assert_eq!(pow.difficulty(), MAX_DIFFICULTY);
        assert_eq!(pow.target().len(), 64);
    }
}
