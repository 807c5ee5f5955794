//! Proof-of-stake: the block producer is drawn at random with probability
//! proportional to its stake among addresses holding at least `min_stake`.
//!
//! `validate_block` only checks that the address recorded in the proof holds
//! enough stake in *this* node's stake table. Nothing binds the proof to the
//! actual author of the block.

use super::{BlockTemplate, ConsensusAlgorithm, MiningError, Sealer, POS_BLOCK_REWARD};
use crate::blockchain::{Block, Blockchain};
use crate::error::ChainError;
use crate::transaction::Transaction;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::debug;

pub const DEFAULT_MIN_STAKE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ProofOfStake {
    /// Ordered by address; selection walks this order.
    stakes: BTreeMap<String, f64>,
    min_stake: f64,
    difficulty: u32,
}

impl Default for ProofOfStake {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_STAKE)
    }
}

impl ProofOfStake {
    pub fn new(min_stake: f64) -> Self {
        Self {
            stakes: BTreeMap::new(),
            min_stake,
            difficulty: 1,
        }
    }

    pub fn min_stake(&self) -> f64 {
        self.min_stake
    }

    pub fn set_min_stake(&mut self, min_stake: f64) {
        self.min_stake = min_stake;
    }

    pub fn stakes(&self) -> &BTreeMap<String, f64> {
        &self.stakes
    }

    pub fn add_stake(&mut self, address: &str, amount: f64) -> Result<(), ChainError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(ChainError::InvalidTransaction(format!(
                "Stake amount must be positive, got {}",
                amount
            )));
        }
        *self.stakes.entry(address.to_string()).or_insert(0.0) += amount;
        Ok(())
    }

    /// Withdraw `amount`; fails (returns `false`) if the address holds less.
    pub fn remove_stake(&mut self, address: &str, amount: f64) -> bool {
        match self.stakes.get_mut(address) {
            Some(stake) if *stake >= amount => {
                *stake -= amount;
                if *stake <= 0.0 {
                    self.stakes.remove(address);
                }
                true
            }
            _ => false,
        }
    }

    pub fn get_stake(&self, address: &str) -> f64 {
        self.stakes.get(address).copied().unwrap_or(0.0)
    }

    fn eligible(&self) -> impl Iterator<Item = (&String, f64)> {
        self.stakes
            .iter()
            .map(|(addr, stake)| (addr, *stake))
            .filter(move |(_, stake)| *stake >= self.min_stake && *stake > 0.0)
    }

    pub fn total_eligible_stake(&self) -> f64 {
        self.eligible().map(|(_, stake)| stake).sum()
    }

    pub fn select_validator(&self) -> Option<String> {
        self.select_validator_with(&mut rand::thread_rng())
    }

    /// Weighted draw: pick a point in `[0, total)` and return the first
    /// address whose cumulative stake exceeds it.
    pub fn select_validator_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<String> {
        let total = self.total_eligible_stake();
        if total <= 0.0 {
            return None;
        }

        let draw = rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        let mut last = None;
        for (address, stake) in self.eligible() {
            cumulative += stake;
            if cumulative > draw {
                return Some(address.clone());
            }
            last = Some(address);
        }
        // Only reachable through float rounding at the top of the range.
        last.cloned()
    }

    /// Eligibility check and validator draw. Only this step reads the stake
    /// table; the returned template seals without it.
    pub fn prepare_with_rng<R: Rng + ?Sized>(
        &self,
        ledger: &mut Blockchain,
        miner_address: &str,
        rng: &mut R,
    ) -> Result<BlockTemplate, MiningError> {
        let stake = self.get_stake(miner_address);
        if stake < self.min_stake {
            return Err(MiningError::InsufficientStake {
                address: miner_address.to_string(),
                stake,
                min_stake: self.min_stake,
            });
        }

        let selected = self
            .select_validator_with(rng)
            .ok_or(MiningError::NoEligibleValidator)?;
        if selected != miner_address {
            return Err(MiningError::NotSelectedValidator {
                address: miner_address.to_string(),
                selected,
            });
        }

        let reward = Transaction::reward(selected.as_str(), POS_BLOCK_REWARD);
        let template = BlockTemplate::from_ledger(ledger, reward, Sealer::Stake { validator: selected });
        debug!("Forging block {} as validator {}", template.index, miner_address);
        Ok(template)
    }

    pub fn mine_with_rng<R: Rng + ?Sized>(
        &mut self,
        ledger: &mut Blockchain,
        miner_address: &str,
        rng: &mut R,
    ) -> Result<Block, MiningError> {
        let template = self.prepare_with_rng(ledger, miner_address, rng)?;
        let block = template.seal();
        template.commit(ledger, block.clone())?;
        Ok(block)
    }
}

impl ConsensusAlgorithm for ProofOfStake {
    fn name(&self) -> &'static str {
        "Proof of Stake"
    }

    fn difficulty(&self) -> u32 {
        self.difficulty
    }

    fn set_difficulty(&mut self, difficulty: u32) {
        self.difficulty = difficulty;
    }

    fn prepare(&self, ledger: &mut Blockchain, miner_address: &str) -> Result<BlockTemplate, MiningError> {
        self.prepare_with_rng(ledger, miner_address, &mut rand::thread_rng())
    }

    fn validate_block(&self, block: &Block, previous: &Block) -> bool {
        if block.index != previous.index + 1
            || block.previous_hash != previous.hash
            || !block.has_valid_hash()
        {
            return false;
        }
        match block.proof.as_validator() {
            Some(validator) => self.get_stake(validator) >= self.min_stake,
            None => false,
        }
    }
}
