//! Pending-transaction pool
//!
//! Insertion order is preserved; it is the order transactions land in the
//! next mined block.

use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mempool {
    transactions: Vec<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_transactions(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }

    /// Append without deduplication.
    pub fn push(&mut self, tx: Transaction) {
        self.transactions.push(tx);
    }

    /// Append unless an identical transaction is already pending.
    /// Returns `true` when the transaction was added.
    pub fn insert_unique(&mut self, tx: Transaction) -> bool {
        if self.contains(&tx) {
            return false;
        }
        self.transactions.push(tx);
        true
    }

    pub fn contains(&self, tx: &Transaction) -> bool {
        self.transactions.iter().any(|pending| pending == tx)
    }

    /// Drop every pending transaction that appears in `included`.
    /// Returns the number removed.
    pub fn remove_included(&mut self, included: &[Transaction]) -> usize {
        let before = self.transactions.len();
        self.transactions.retain(|pending| !included.contains(pending));
        before - self.transactions.len()
    }

    /// Remove the first pending copy of `tx`.
    pub fn remove(&mut self, tx: &Transaction) -> bool {
        match self.transactions.iter().position(|pending| pending == tx) {
            Some(pos) => {
                self.transactions.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_unique_deduplicates_by_value() {
        let mut pool = Mempool::new();
        let tx = Transaction::new("alice", "bob", 3.0).with_signature("sig");

        assert!(pool.insert_unique(tx.clone()));
        assert!(!pool.insert_unique(tx.clone()));
        assert_eq!(pool.len(), 1);

        let mut other = tx;
        other.amount = 4.0;
        assert!(pool.insert_unique(other));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_remove_included_keeps_order_of_the_rest() {
        let a = Transaction::new("a", "b", 1.0).with_signature("s");
        let b = Transaction::new("b", "c", 2.0).with_signature("s");
        let c = Transaction::new("c", "d", 3.0).with_signature("s");
        let mut pool = Mempool::from_transactions(vec![a.clone(), b.clone(), c.clone()]);

        assert_eq!(pool.remove_included(&[b]), 1);
        assert_eq!(pool.transactions(), &[a, c]);
    }

    #[test]
    fn test_remove_takes_a_single_copy() {
        let tx = Transaction::reward("miner", 100.0);
        let mut pool = Mempool::from_transactions(vec![tx.clone(), tx.clone()]);

        assert!(pool.remove(&tx));
        assert_eq!(pool.len(), 1);
        assert!(pool.remove(&tx));
        assert!(!pool.remove(&tx));
    }
}
