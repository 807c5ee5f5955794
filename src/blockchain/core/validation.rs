use crate::consensus::ConsensusAlgorithm;
use crate::error::ChainError;

use super::chain::{Block, GENESIS_PREVIOUS_HASH};

/// Index contiguity, previous-hash linkage and hash recomputation.
/// Consensus proofs are checked separately by the engine.
pub fn check_block(block: &Block, previous: &Block) -> Result<(), ChainError> {
    if block.index != previous.index + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block index. Expected {}, but got {}.",
            previous.index + 1,
            block.index
        )));
    }

    if block.previous_hash != previous.hash {
        return Err(ChainError::InvalidBlockLinkage);
    }

    if !block.has_valid_hash() {
        return Err(ChainError::InvalidBlock(format!(
            "Hash mismatch for block {}. Expected {}, but got {}.",
            block.index,
            block.calculate_hash(),
            block.hash
        )));
    }

    Ok(())
}

pub fn check_genesis(block: &Block) -> Result<(), ChainError> {
    if block.index != 0 {
        return Err(ChainError::InvalidChain(format!(
            "Genesis block must have index 0, got {}",
            block.index
        )));
    }
    if block.previous_hash != GENESIS_PREVIOUS_HASH {
        return Err(ChainError::InvalidChain(
            "Genesis block must reference previous hash \"0\"".to_string(),
        ));
    }
    if !block.transactions.is_empty() {
        return Err(ChainError::InvalidChain(
            "Genesis block must not carry transactions".to_string(),
        ));
    }
    if !block.has_valid_hash() {
        return Err(ChainError::InvalidChain("Genesis block hash mismatch".to_string()));
    }
    Ok(())
}

/// Walk `chain` from genesis. With `consensus` set every non-genesis block
/// must also satisfy the engine's proof rule.
pub fn validate_chain(
    chain: &[Block],
    consensus: Option<&dyn ConsensusAlgorithm>,
) -> Result<(), ChainError> {
    let genesis = chain
        .first()
        .ok_or_else(|| ChainError::InvalidChain("Chain is empty".to_string()))?;
    check_genesis(genesis)?;

    for pair in chain.windows(2) {
        let (previous, block) = (&pair[0], &pair[1]);
        check_block(block, previous)
            .map_err(|e| ChainError::InvalidChain(format!("block {}: {}", block.index, e)))?;

        if let Some(engine) = consensus {
            if !engine.validate_block(block, previous) {
                return Err(ChainError::InvalidChain(format!(
                    "block {} fails {} validation",
                    block.index,
                    engine.name()
                )));
            }
        }
    }
    Ok(())
}
