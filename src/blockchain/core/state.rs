use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

use super::chain::Block;

/// Persisted form of the ledger: the ordered block records plus the
/// pending-transaction array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub chain: Vec<Block>,
    #[serde(default)]
    pub pending_transactions: Vec<Transaction>,
}

impl LedgerSnapshot {
    pub fn height(&self) -> usize {
        self.chain.len()
    }
}
